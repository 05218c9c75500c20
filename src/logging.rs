//! Tracing setup for the drivelog daemon and CLI.
//!
//! Console output is compact and shows the active `reconcile` span, so every
//! line logged during a pass carries the signal that triggered it. JSON output
//! also emits a record when each span closes, which gives per-pass timing.

use std::time::{Duration, Instant};

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per line instead of human-readable text
    pub json: bool,
    /// Debug level for drivelog itself
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// Filter used when `RUST_LOG` is not set. The watcher backend is kept at
/// warn: its debug output is one line per inotify event.
fn default_directives(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("drivelog={level},notify=warn")
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config.verbose)));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_thread_names(config.verbose),
            )
            .init();
    }
}

/// Rate limit for one noisy source, such as a volume's watch errors.
///
/// Owned by the thread that logs, so it needs no synchronization. Messages
/// dropped in between are counted and reported with the next one let through.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// `Some(n)` if this message should be logged, where `n` is how many were
    /// dropped since the last one. `None` if it should be dropped.
    pub fn admit(&mut self) -> Option<u64> {
        self.admit_at(Instant::now())
    }

    fn admit_at(&mut self, now: Instant) -> Option<u64> {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(default_directives(false), "drivelog=info,notify=warn");
        assert_eq!(default_directives(true), "drivelog=debug,notify=warn");
    }

    #[test]
    fn test_log_config_from_app_config() {
        let config = AppConfig {
            json_logs: true,
            ..AppConfig::default()
        };
        let log = LogConfig::from(&config);
        assert!(log.json);
        assert!(!log.verbose);
    }

    #[test]
    fn test_throttle_counts_dropped_messages() {
        let mut throttle = LogThrottle::new(Duration::from_secs(5));
        let t0 = Instant::now();

        assert_eq!(throttle.admit_at(t0), Some(0));
        assert_eq!(throttle.admit_at(t0 + Duration::from_secs(1)), None);
        assert_eq!(throttle.admit_at(t0 + Duration::from_secs(2)), None);
        assert_eq!(throttle.admit_at(t0 + Duration::from_secs(6)), Some(2));
        assert_eq!(throttle.admit_at(t0 + Duration::from_secs(7)), None);
    }
}
