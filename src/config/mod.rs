//! Configuration: TOML file plus a process-wide handle.

pub mod auth;
pub mod backend;
pub mod cache;
pub mod general;
pub mod routing;

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;

pub use auth::{AuthSettings, FrontendAuthMethod};
pub use backend::BackendConfig;
pub use cache::{CacheMethod, CacheSettings};
pub use general::General;
pub use routing::{ClusterMode, DisableLoadBalanceOnWrite, Routing};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub general: General,

    #[serde(default)]
    pub routing: Routing,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.backends.is_empty() {
            return Err(Error::BadConfig("no backends configured".into()));
        }
        if self.backends.iter().filter(|b| b.primary).count() > 1 {
            return Err(Error::BadConfig(
                "more than one backend is marked primary".into(),
            ));
        }
        if self.routing.mode == ClusterMode::Raw && self.backends.len() > 1 {
            return Err(Error::BadConfig(
                "raw mode supports exactly one backend".into(),
            ));
        }
        if self.cache.enabled && self.cache.block_size < 512 {
            return Err(Error::BadConfig(format!(
                "cache block_size {} is too small",
                self.cache.block_size
            )));
        }
        Ok(())
    }
}

static CONFIG: Lazy<RwLock<Arc<Config>>> = Lazy::new(|| RwLock::new(Arc::new(Config::default())));

/// Current process-wide configuration.
pub fn get_config() -> Arc<Config> {
    CONFIG.read().clone()
}

pub fn set_config(config: Config) {
    *CONFIG.write() = Arc::new(config);
}

/// Parse and install a configuration file.
pub async fn init_config(path: &str) -> Result<(), Error> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| Error::BadConfig(format!("could not read {path}: {err}")))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|err| Error::BadConfig(format!("could not parse {path}: {err}")))?;
    config.validate()?;
    set_config(config);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_document() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.general.port, 9999);
        assert_eq!(config.routing.mode, ClusterMode::StreamingReplication);
        assert!(config.routing.load_balance_mode);
        assert_eq!(config.cache.block_size, 8192);
    }

    #[test]
    fn full_document_round_trips() {
        let doc = r#"
            [general]
            host = "127.0.0.1"
            port = 6432

            [routing]
            mode = "native_replication"
            statement_level_load_balance = true
            delay_threshold = 10485760

            [cache]
            enabled = true
            total_size = 1048576
            expire = 60

            [[backends]]
            host = "pg0"
            port = 5432
            primary = true

            [[backends]]
            host = "pg1"
            port = 5432
            weight = 2
        "#;
        let config: Config = toml::from_str(doc).unwrap();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[1].weight, 2);
        assert_eq!(config.routing.mode, ClusterMode::NativeReplication);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.num_blocks(), 128);
    }

    #[test]
    fn two_primaries_are_rejected() {
        let doc = r#"
            [[backends]]
            host = "pg0"
            port = 5432
            primary = true

            [[backends]]
            host = "pg1"
            port = 5432
            primary = true
        "#;
        let config: Config = toml::from_str(doc).unwrap();
        assert!(config.validate().is_err());
    }
}
