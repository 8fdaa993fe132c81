//! CLI argument definitions for the cadence server.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

/// Cadence - paced, quota-guarded social automation engine.
#[derive(Parser, Debug)]
#[command(name = "cadence", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", env = "CADENCE_CONFIG")]
    pub config: Option<PathBuf>,

    /// API server port.
    #[arg(short = 'p', long = "port", env = "CADENCE_PORT")]
    pub port: Option<u16>,

    /// Address to bind the API server to.
    #[arg(short = 'b', long = "bind")]
    pub bind: Option<String>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,
}

impl CliArgs {
    /// Resolve the configuration file path: --config / CADENCE_CONFIG > ~/.cadence/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        match self.config {
            Some(ref p) => p.clone(),
            None => default_config_path(),
        }
    }

    /// Resolve the API server port: --port / CADENCE_PORT > config file value.
    pub fn resolve_port(&self, config_port: u16) -> u16 {
        self.port.unwrap_or(config_port)
    }

    pub fn resolve_bind(&self, config_bind: &str) -> String {
        self.bind
            .clone()
            .unwrap_or_else(|| config_bind.to_string())
    }

    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".cadence").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".cadence").join("config.toml");
    }
    PathBuf::from("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = CliArgs::parse_from([
            "cadence",
            "--config",
            "/tmp/cadence.toml",
            "--port",
            "4000",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.resolve_config_path(), PathBuf::from("/tmp/cadence.toml"));
        assert_eq!(args.resolve_port(3040), 4000);
        assert_eq!(args.resolve_log_level("info"), "debug");
        assert_eq!(args.resolve_bind("127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn test_config_values_used_without_flags() {
        let args = CliArgs {
            config: None,
            port: None,
            bind: None,
            log_level: None,
        };
        assert_eq!(args.resolve_port(3040), 3040);
        assert_eq!(args.resolve_log_level("warn"), "warn");
        assert!(args.resolve_config_path().ends_with("config.toml"));
    }
}
