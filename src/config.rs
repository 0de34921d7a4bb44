//! Environment-driven configuration.
//!
//! All settings come from the process environment (a `.env` file is
//! loaded first when present). `AMQP_URL` and `REDIS_URL` are required;
//! everything else has a sensible default.

use std::env;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Deployment mode of the node. Anything other than `prod` (combined
/// with a non-production `APP_ENV`) targets the exchange testnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    #[default]
    Dev,
    Test,
    Prod,
    Staging,
    Demo,
}

impl FromStr for ServerMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dev" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" => Ok(Self::Prod),
            "staging" => Ok(Self::Staging),
            "demo" => Ok(Self::Demo),
            other => Err(Error::Config(format!("unknown SERVER_MODE: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub redis_url: String,
    pub amqp_url: String,
    /// Name of the AMQP topic exchange all routing keys live on.
    pub bitmex_exchange: String,
    pub server_mode: ServerMode,
    pub app_env: String,
    pub log_level: String,
    pub server_reload: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            host: env_or("HOST", "127.0.0.1"),
            port: env_or("PORT", "8081")
                .parse()
                .map_err(|e| Error::Config(format!("PORT must be a number: {e}")))?,
            redis_url: require("REDIS_URL")?,
            amqp_url: require("AMQP_URL")?,
            bitmex_exchange: env_or("BITMEX_EXCHANGE", "bitmex"),
            server_mode: env_or("SERVER_MODE", "dev").parse()?,
            app_env: env_or("APP_ENV", "development"),
            log_level: env_or("LOG_LEVEL", "info"),
            server_reload: env_or("SERVER_RELOAD", "false")
                .parse()
                .unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bitmex_exchange.is_empty() {
            return Err(Error::Config("BITMEX_EXCHANGE cannot be empty".into()));
        }
        Ok(())
    }

    /// The exchange sandbox (testnet) is used unless the node runs in
    /// production proper.
    pub fn sandbox(&self) -> bool {
        self.server_mode != ServerMode::Prod && self.app_env != "production"
    }

    /// Install the global tracing subscriber. JSON output in the server
    /// modes that ship logs, human-readable output everywhere else.
    pub fn init_logging(&self) {
        let filter = EnvFilter::try_new(&self.log_level)
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let structured = matches!(
            self.server_mode,
            ServerMode::Prod | ServerMode::Staging | ServerMode::Demo
        );

        if structured {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn require(key: &str) -> Result<String> {
    env::var(key).map_err(|_| Error::Config(format!("{key} must be set")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_mode_parses_case_insensitively() {
        assert_eq!("PROD".parse::<ServerMode>().unwrap(), ServerMode::Prod);
        assert_eq!("staging".parse::<ServerMode>().unwrap(), ServerMode::Staging);
        assert!("live".parse::<ServerMode>().is_err());
    }

    #[test]
    fn sandbox_requires_both_production_signals() {
        let base = Config {
            host: "127.0.0.1".into(),
            port: 8081,
            redis_url: "redis://localhost".into(),
            amqp_url: "amqp://localhost".into(),
            bitmex_exchange: "bitmex".into(),
            server_mode: ServerMode::Dev,
            app_env: "development".into(),
            log_level: "info".into(),
            server_reload: false,
        };
        assert!(base.sandbox());

        let prod_mode = Config {
            server_mode: ServerMode::Prod,
            ..base.clone()
        };
        assert!(!prod_mode.sandbox());

        let prod_env = Config {
            app_env: "production".into(),
            ..base
        };
        assert!(!prod_env.sandbox());
    }
}
