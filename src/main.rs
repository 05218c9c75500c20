use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use drivelog::config::AppConfig;
use drivelog::core::{Orchestrator, SessionRecord, Snapshotter, format_size};
use drivelog::db::SqliteStore;
use drivelog::logging::{self, LogConfig};
use drivelog::rpc::{
    ActiveSessions, DaemonStatus, DeviceHistory, Registration, RpcClient, RpcServer,
};
use drivelog::{adapters, context};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "drivelog")]
#[command(about = "Removable storage session tracker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to /etc/drivelog/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracking daemon
    Daemon(ServerArgs),
    /// Show daemon health
    Status,
    /// List open sessions
    Active,
    /// List recorded sessions, newest first
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// List every device seen, with its latest session
    Devices,
    /// Show the session history of one device
    History { serial_number: String },
    /// Mark every session of a device as registered
    Register { serial_number: String },
    /// Print the directory tree of a path as the daemon would record it
    Tree { path: PathBuf },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    coalesce_window_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let config = match &cli.command {
        Commands::Daemon(args) => AppConfig::new(Some(args), config_path)?,
        _ => AppConfig::new(None::<&ServerArgs>, config_path)?,
    };

    logging::init(LogConfig::from(&config));

    match cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Daemon failed")?,
        Commands::Status => run_status(&config)
            .await
            .context("Failed to check status of daemon")?,
        Commands::Active => run_active(&config)
            .await
            .context("Failed to list open sessions")?,
        Commands::Sessions { limit, offset } => run_sessions(&config, limit, offset)
            .await
            .context("Failed to list sessions")?,
        Commands::Devices => run_devices(&config)
            .await
            .context("Failed to list devices")?,
        Commands::History { serial_number } => run_history(&config, &serial_number)
            .await
            .context("Failed to fetch device history")?,
        Commands::Register { serial_number } => run_register(&config, &serial_number)
            .await
            .context("Failed to register device")?,
        Commands::Tree { path } => {
            let snapshotter = Snapshotter::new(config.reserved_dirs.clone());
            print!("{}", snapshotter.snapshot(&path));
        }
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let store = SqliteStore::open(&config.database_path).await?;
    let ctx = context::AppContext::new(config, Arc::new(store));

    let adapter = adapters::get_adapter(ctx.config.simulation);
    let orchestrator = Orchestrator::new(&ctx, adapter);

    let rpc = Arc::new(RpcServer::bind(ctx.clone(), ctx.config.rpc_bind).await?);
    let rpc_task = {
        let rpc = rpc.clone();
        tokio::spawn(async move { rpc.start().await })
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    info!(
        database = %ctx.config.database_path.display(),
        simulation = ctx.config.simulation,
        "drivelog daemon started"
    );
    orchestrator.run(shutdown).await?;

    rpc.shutdown();
    rpc_task.await.context("RPC server task panicked")??;
    info!("drivelog daemon stopped");
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(e) => {
                warn!(error = %e, "Cannot listen for Ctrl-C");
                return;
            }
        },
        _ = terminate => info!("Terminated, shutting down"),
    }
    shutdown.cancel();
}

async fn run_status(config: &AppConfig) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);
    let status: DaemonStatus = client.call_no_params("daemon.status").await?;

    println!("drivelog {} (up {}s)", status.version, status.uptime_secs);
    println!("  rpc:             {}", status.rpc_bind);
    println!("  simulation:      {}", status.simulation);
    println!("  open sessions:   {}", status.active_sessions);
    Ok(())
}

async fn run_active(config: &AppConfig) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);
    let active: ActiveSessions = client.call_no_params("sessions.active").await?;

    if active.count == 0 {
        println!("No open sessions");
        return Ok(());
    }
    for session in active.sessions {
        println!(
            "{}  {}  {}  since {}  {} transferred, {} log lines",
            session.serial_number,
            session.mount_id,
            session.display_name,
            session.insertion_time.format("%Y-%m-%d %H:%M:%S"),
            format_size(session.bytes_transferred),
            session.log_lines,
        );
    }
    Ok(())
}

async fn run_sessions(config: &AppConfig, limit: u32, offset: u32) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);
    let sessions: Vec<SessionRecord> = client
        .call("sessions.list", Some(json!({ "limit": limit, "offset": offset })))
        .await?;

    if sessions.is_empty() {
        println!("No sessions recorded");
        return Ok(());
    }
    for session in &sessions {
        print_session(session);
    }
    Ok(())
}

fn print_session(session: &SessionRecord) {
    let removed = session
        .removal_time
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "open".to_string());
    println!(
        "{}  {}  {} -> {}{}",
        session.id,
        session.serial_number,
        session.insertion_time.format("%Y-%m-%d %H:%M:%S"),
        removed,
        if session.is_registered { "  [registered]" } else { "" },
    );
}

async fn run_devices(config: &AppConfig) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);
    let latest: Vec<SessionRecord> = client.call_no_params("devices.list").await?;

    if latest.is_empty() {
        println!("No devices recorded");
        return Ok(());
    }
    for session in latest {
        let name = session
            .device_snapshot
            .display_name
            .clone()
            .unwrap_or_else(|| session.device_snapshot.caption.clone());
        println!(
            "{}  {}  last seen {}  {}",
            session.serial_number,
            name,
            session.insertion_time.format("%Y-%m-%d %H:%M:%S"),
            if session.is_registered { "registered" } else { "unregistered" },
        );
    }
    Ok(())
}

async fn run_history(config: &AppConfig, serial_number: &str) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);
    let history: DeviceHistory = client
        .call(
            "devices.sessions",
            Some(json!({ "serial_number": serial_number })),
        )
        .await?;

    if let Some(live) = &history.live {
        println!(
            "Attached at {} since {}, {} transferred",
            live.mount_id,
            live.insertion_time.format("%Y-%m-%d %H:%M:%S"),
            format_size(live.bytes_transferred),
        );
    }
    for session in &history.sessions {
        print_session(session);
    }
    Ok(())
}

async fn run_register(config: &AppConfig, serial_number: &str) -> Result<()> {
    let client = RpcClient::new(config.rpc_bind);
    let registration: Registration = client
        .call(
            "devices.register",
            Some(json!({ "serial_number": serial_number })),
        )
        .await?;

    println!(
        "Registered {} ({} sessions updated)",
        registration.serial_number, registration.sessions_updated
    );
    Ok(())
}
