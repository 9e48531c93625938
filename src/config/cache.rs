//! Shared result cache settings.

use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheMethod {
    #[default]
    Shmem,
    Memcached,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub method: CacheMethod,

    /// Total size of the block store in bytes (shmem method).
    #[serde(default = "CacheSettings::default_total_size")]
    pub total_size: usize,

    /// Size of one block; also the maximum free space of an empty block.
    #[serde(default = "CacheSettings::default_block_size")]
    pub block_size: usize,

    /// Upper bound on one cached entry, bytes.
    #[serde(default = "CacheSettings::default_maxcache")]
    pub maxcache: usize,

    /// Expected number of cache entries; sizes the hash index.
    #[serde(default = "CacheSettings::default_max_num_cache")]
    pub max_num_cache: usize,

    /// Entry lifetime in seconds; zero disables expiry.
    #[serde(default)]
    pub expire: u64,

    /// Delete dependent entries when a committed write is observed.
    #[serde(default = "CacheSettings::default_auto_invalidation")]
    pub auto_invalidation: bool,

    /// Directory for the per-database table-oid map.
    #[serde(default = "CacheSettings::default_oiddir")]
    pub oiddir: String,

    /// Tables cached even when they look unsafe.
    #[serde(default)]
    pub safe_table_list: Vec<String>,

    /// Tables never cached; wins over the safe list.
    #[serde(default)]
    pub unsafe_table_list: Vec<String>,

    #[serde(default = "CacheSettings::default_memcached_host")]
    pub memcached_host: String,

    #[serde(default = "CacheSettings::default_memcached_port")]
    pub memcached_port: u16,
}

impl CacheSettings {
    pub fn default_total_size() -> usize {
        64 * 1024 * 1024
    }
    pub fn default_block_size() -> usize {
        8192
    }
    pub fn default_maxcache() -> usize {
        400 * 1024
    }
    pub fn default_max_num_cache() -> usize {
        1_000_000
    }
    pub fn default_auto_invalidation() -> bool {
        true
    }
    pub fn default_oiddir() -> String {
        "/var/log/pg_relay/oiddir".into()
    }
    pub fn default_memcached_host() -> String {
        "localhost".into()
    }
    pub fn default_memcached_port() -> u16 {
        11211
    }

    pub fn num_blocks(&self) -> usize {
        self.total_size / self.block_size
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}
