//! Static backend slot definitions.

use serde_derive::{Deserialize, Serialize};

/// One configured backend database.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,

    /// Load-balance weight; zero excludes the node from read traffic.
    #[serde(default = "BackendConfig::default_weight")]
    pub weight: u32,

    /// In streaming-replication mode, marks the write node.
    #[serde(default)]
    pub primary: bool,

    /// Recorded for the external failover orchestrator; not acted on here.
    #[serde(default = "BackendConfig::default_allow_to_failover")]
    pub allow_to_failover: bool,
}

impl BackendConfig {
    pub fn default_weight() -> u32 {
        1
    }
    pub fn default_allow_to_failover() -> bool {
        true
    }
}
