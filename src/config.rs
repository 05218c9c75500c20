use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/drivelog/config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub rpc_bind: SocketAddr,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    /// Modify events within this many seconds of a Create are folded into it.
    pub coalesce_window_secs: u64,
    /// Directory names the tree snapshot skips.
    pub reserved_dirs: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("drivelog.db"),
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7420)),
            simulation: false,
            verbose: false,
            json_logs: false,
            coalesce_window_secs: 5,
            reserved_dirs: vec![
                "System Volume Information".to_string(),
                "lost+found".to_string(),
            ],
        }
    }
}

impl AppConfig {
    /// Layer defaults, the config file, `DRIVELOG_*` variables and finally
    /// any CLI overrides (serialized args, unset fields skipped).
    pub fn new<T: Serialize>(args: Option<&T>, config_path: Option<&Path>) -> Result<Self> {
        let file = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("DRIVELOG_"));

        if let Some(args) = args {
            figment = figment.merge(Serialized::defaults(args));
        }

        figment
            .extract()
            .with_context(|| format!("Invalid configuration (file: {})", file.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        coalesce_window_secs: Option<u64>,
    }

    #[test]
    fn test_defaults_without_file() {
        let config =
            AppConfig::new(None::<&Overrides>, Some(Path::new("/nonexistent/drivelog.toml")))
                .unwrap();
        assert_eq!(config.coalesce_window_secs, 5);
        assert_eq!(config.rpc_bind.port(), 7420);
        assert!(config.reserved_dirs.contains(&"lost+found".to_string()));
    }

    #[test]
    fn test_file_then_args_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "verbose = true\ncoalesce_window_secs = 10").unwrap();

        let args = Overrides {
            verbose: None,
            coalesce_window_secs: Some(2),
        };
        let config = AppConfig::new(Some(&args), Some(file.path())).unwrap();

        assert!(config.verbose);
        assert_eq!(config.coalesce_window_secs, 2);
    }

    #[test]
    fn test_renders_as_toml() {
        let rendered = AppConfig::default().to_toml().unwrap();
        assert!(rendered.contains("database_path = \"drivelog.db\""));
        assert!(rendered.contains("rpc_bind = \"127.0.0.1:7420\""));
    }
}
