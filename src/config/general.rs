//! General listener and session settings.

use serde_derive::{Deserialize, Serialize};

/// General configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct General {
    #[serde(default = "General::default_host")]
    pub host: String,

    #[serde(default = "General::default_port")]
    pub port: u16,

    /// Reported to backends when the client supplies no application_name.
    #[serde(default = "General::default_application_name")]
    pub application_name: String,

    /// Backend connect timeout, milliseconds.
    #[serde(default = "General::default_connect_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "General::default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    #[serde(default = "General::default_tcp_keepalives_idle")]
    pub tcp_keepalives_idle: u64,
    #[serde(default = "General::default_tcp_keepalives_count")]
    pub tcp_keepalives_count: u32,
    #[serde(default = "General::default_tcp_keepalives_interval")]
    pub tcp_keepalives_interval: u64,
    #[serde(default = "General::default_tcp_no_delay")]
    pub tcp_no_delay: bool,

    #[serde(default)]
    pub log_client_connections: bool,

    #[serde(default)]
    pub log_per_node_statement: bool,

    /// Syslog program name; when set, logging goes to syslog instead of stderr.
    #[serde(default)]
    pub syslog_prog_name: Option<String>,
}

impl General {
    pub fn default_host() -> String {
        "0.0.0.0".into()
    }
    pub fn default_port() -> u16 {
        9999
    }
    pub fn default_application_name() -> String {
        "pg_relay".into()
    }
    pub fn default_connect_timeout() -> u64 {
        5_000
    }
    pub fn default_shutdown_timeout() -> u64 {
        10_000
    }
    pub fn default_tcp_keepalives_idle() -> u64 {
        60
    }
    pub fn default_tcp_keepalives_count() -> u32 {
        3
    }
    pub fn default_tcp_keepalives_interval() -> u64 {
        10
    }
    pub fn default_tcp_no_delay() -> bool {
        true
    }
}

impl Default for General {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}
