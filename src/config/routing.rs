//! Cluster mode and query routing settings.

use serde_derive::{Deserialize, Serialize};

/// How the backend cluster replicates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    /// Single backend, no routing decisions.
    Raw,
    /// Writes to the primary, reads load-balanced over standbys; the
    /// backends replicate among themselves.
    StreamingReplication,
    /// The pooler itself replicates writes to every backend.
    NativeReplication,
}

impl ClusterMode {
    /// True for the modes that track a primary node.
    pub fn has_primary(&self) -> bool {
        matches!(self, ClusterMode::StreamingReplication)
    }
}

/// When a write inside a transaction disables load balancing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisableLoadBalanceOnWrite {
    Off,
    /// Until the transaction ends.
    #[default]
    Transaction,
    /// For the rest of the session once any transaction wrote.
    TransTransaction,
    /// A single write disables load balancing for every later statement.
    Always,
    /// Track written objects and route only SELECTs touching them to primary.
    DmlAdaptive,
}

/// Routing configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Routing {
    #[serde(default = "Routing::default_mode")]
    pub mode: ClusterMode,

    #[serde(default = "Routing::default_load_balance_mode")]
    pub load_balance_mode: bool,

    /// Re-pick the load-balance node for every SELECT instead of per session.
    #[serde(default)]
    pub statement_level_load_balance: bool,

    /// Replication delay (bytes) above which the load-balance node is avoided.
    #[serde(default)]
    pub delay_threshold: u64,

    /// On excess delay, re-pick the least-delayed standby instead of primary.
    #[serde(default)]
    pub prefer_lower_delay_standby: bool,

    #[serde(default)]
    pub disable_load_balance_on_write: DisableLoadBalanceOnWrite,

    /// In native replication, replicate SELECTs to all backends.
    #[serde(default)]
    pub replicate_select: bool,

    #[serde(default = "Routing::default_check_temp_table")]
    pub check_temp_table: bool,

    #[serde(default = "Routing::default_check_unlogged_table")]
    pub check_unlogged_table: bool,

    /// Regex patterns; matching SELECTs are routed to primary.
    #[serde(default)]
    pub primary_routing_query_pattern_list: Vec<String>,

    /// Functions safe to load balance even though they look volatile.
    #[serde(default)]
    pub read_only_function_list: Vec<String>,

    /// Functions that force primary routing.
    #[serde(default)]
    pub write_function_list: Vec<String>,
}

impl Routing {
    pub fn default_mode() -> ClusterMode {
        ClusterMode::StreamingReplication
    }
    pub fn default_load_balance_mode() -> bool {
        true
    }
    pub fn default_check_temp_table() -> bool {
        true
    }
    pub fn default_check_unlogged_table() -> bool {
        true
    }
}

impl Default for Routing {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}
