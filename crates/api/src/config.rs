//! API server configuration

use std::time::Duration;

use anyhow::{bail, Context};
use billsync_billing::DEFAULT_SYNC_TIMEOUT_SECS;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Shared secret for the sync and snapshot endpoints
    pub internal_api_token: String,
    pub sync_timeout: Duration,
    pub run_migrations: bool,
    pub log_format: LogFormat,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("sync_timeout", &self.sync_timeout)
            .field("run_migrations", &self.run_migrations)
            .field("log_format", &self.log_format)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let internal_api_token =
            std::env::var("INTERNAL_API_TOKEN").context("INTERNAL_API_TOKEN must be set")?;
        if internal_api_token.trim().len() < 16 {
            bail!("INTERNAL_API_TOKEN must be at least 16 characters");
        }

        let sync_timeout_secs = match std::env::var("SYNC_TIMEOUT_SECS") {
            Ok(value) => value
                .trim()
                .parse::<u64>()
                .context("SYNC_TIMEOUT_SECS must be a whole number")?,
            Err(_) => DEFAULT_SYNC_TIMEOUT_SECS,
        };

        let run_migrations = std::env::var("RUN_MIGRATIONS")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true);

        let log_format = match std::env::var("LOG_FORMAT").as_deref() {
            Ok("pretty") | Ok("text") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };

        Ok(Self {
            database_url,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string()),
            internal_api_token,
            sync_timeout: Duration::from_secs(sync_timeout_secs),
            run_migrations,
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 6] = [
        "DATABASE_URL",
        "INTERNAL_API_TOKEN",
        "BIND_ADDRESS",
        "SYNC_TIMEOUT_SECS",
        "RUN_MIGRATIONS",
        "LOG_FORMAT",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/billsync");
        std::env::set_var("INTERNAL_API_TOKEN", "0123456789abcdef");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.sync_timeout, Duration::from_secs(15));
        assert!(config.run_migrations);
        assert_eq!(config.log_format, LogFormat::Json);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/billsync");
        std::env::set_var("INTERNAL_API_TOKEN", "0123456789abcdef");
        std::env::set_var("BIND_ADDRESS", "127.0.0.1:9000");
        std::env::set_var("SYNC_TIMEOUT_SECS", "3");
        std::env::set_var("RUN_MIGRATIONS", "false");
        std::env::set_var("LOG_FORMAT", "pretty");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.sync_timeout, Duration::from_secs(3));
        assert!(!config.run_migrations);
        assert_eq!(config.log_format, LogFormat::Pretty);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_rejects_missing_or_weak_token() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/billsync");
        assert!(Config::from_env().is_err());

        std::env::set_var("INTERNAL_API_TOKEN", "short");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("16 characters"));

        clear_env();
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = Config {
            database_url: "postgres://user:hunter2@db/billsync".to_string(),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            internal_api_token: "super-secret-token-value".to_string(),
            sync_timeout: Duration::from_secs(15),
            run_migrations: true,
            log_format: LogFormat::Json,
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("super-secret"));
    }
}
