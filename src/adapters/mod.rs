use std::sync::Arc;

use tracing::warn;

use crate::core::hardware::HardwareAdapter;

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::LinuxAdapter;
pub use simulated::{SimulatedAdapter, Simulator};

/// Build the platform adapter, or a simulator driven from stdin.
///
/// Simulator commands: `attach <serial> <dir> [mount]` and `detach <serial>`.
pub fn get_adapter(simulation: bool) -> Arc<dyn HardwareAdapter> {
    if simulation {
        let (adapter, controller) = SimulatedAdapter::new();

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines().map_while(std::result::Result::ok) {
                run_command(&controller, &line);
            }
        });

        return Arc::new(adapter);
    }

    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxAdapter::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        warn!("No hardware adapter for this platform, falling back to the simulator");
        get_adapter(true)
    }
}

fn run_command(controller: &Simulator, line: &str) {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["attach", serial, dir] => controller.attach(serial, dir, *dir),
        ["attach", serial, dir, mount] => controller.attach(serial, mount, *dir),
        ["detach", serial] => controller.detach(serial),
        [] => {}
        _ => warn!(
            command = %line.trim(),
            "Use: 'attach <serial> <dir> [mount]' or 'detach <serial>'"
        ),
    }
}
