//! Shared result cache keyed by query fingerprint.
//!
//! The fingerprint is md5 over `user ‖ query_text ‖ database`; entries
//! carry the exact response frames a client would have received. The
//! shared-memory backend keeps the block store of `block.rs` behind one
//! single-writer/multi-reader lock that is never held across wire I/O; the
//! memcached backend delegates storage to an external server.

pub mod block;
pub mod fsmm;
pub mod hashtable;
pub mod memcached;
pub mod oidmap;
pub mod temp;

use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, warn};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::config::{CacheMethod, CacheSettings};
use crate::errors::Error;
use crate::parser::ast::Oid;

pub use block::ShmemCache;
pub use hashtable::CacheId;
pub use oidmap::{OidMap, OidMapRecord};
pub use temp::TempQueryCache;

/// 128-bit cache fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(pub [u8; 16]);

impl CacheKey {
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// md5(user ‖ query_text ‖ database), compared byte-for-byte.
pub fn fingerprint(user: &str, query: &str, database: &str) -> CacheKey {
    let mut md5 = Md5::new();
    md5.update(user.as_bytes());
    md5.update(query.as_bytes());
    md5.update(database.as_bytes());
    CacheKey(md5.finalize().into())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

enum Backend {
    Shmem(RwLock<ShmemCache>),
    Memcached(Mutex<Option<memcached::MemcachedClient>>),
}

/// The process-wide cache facade.
pub struct QueryCache {
    settings: CacheSettings,
    backend: Backend,
    oidmap: OidMap,
}

impl QueryCache {
    pub fn new(settings: CacheSettings) -> Self {
        let backend = match settings.method {
            CacheMethod::Shmem => Backend::Shmem(RwLock::new(ShmemCache::new(
                settings.total_size,
                settings.block_size,
                settings.max_num_cache,
            ))),
            CacheMethod::Memcached => Backend::Memcached(Mutex::new(None)),
        };
        let oidmap = OidMap::new(
            settings.oiddir.clone(),
            settings.method == CacheMethod::Memcached,
        );
        Self {
            settings,
            backend,
            oidmap,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Fetch the stored response frames for a fingerprint, if any.
    pub async fn lookup(&self, key: &CacheKey) -> Option<Vec<u8>> {
        match &self.backend {
            Backend::Shmem(shmem) => {
                // Bind before matching so the write guard is released
                // before any recovery pass retakes it.
                let result = shmem.write().lookup(key, now_secs());
                match result {
                    Ok(result) => result,
                    Err(err) => {
                        self.recover(err);
                        None
                    }
                }
            }
            Backend::Memcached(client) => {
                let mut guard = client.lock().await;
                match self.memcached_ready(&mut guard).await {
                    Some(conn) => match conn.get(key).await {
                        Ok(result) => result,
                        Err(err) => {
                            warn!("memcached lookup failed: {err}");
                            *guard = None;
                            None
                        }
                    },
                    None => None,
                }
            }
        }
    }

    /// Commit one response buffer under a fingerprint, registering its
    /// table dependencies for later invalidation.
    pub async fn insert(
        &self,
        key: CacheKey,
        data: &[u8],
        database: Oid,
        tables: &[Oid],
    ) -> Result<(), Error> {
        if data.len() > self.settings.maxcache {
            return Ok(());
        }
        let ttl = self.settings.expire.min(u32::MAX as u64) as u32;

        match &self.backend {
            Backend::Shmem(shmem) => {
                let inserted = {
                    let mut guard = shmem.write();
                    match guard.insert(key, data, now_secs(), ttl) {
                        Ok(inserted) => inserted,
                        Err(err) => {
                            drop(guard);
                            self.recover(err);
                            return Ok(());
                        }
                    }
                };
                if let Some(cacheid) = inserted {
                    self.oidmap
                        .register(database, tables, OidMapRecord::CacheId(cacheid))?;
                }
            }
            Backend::Memcached(client) => {
                let mut guard = client.lock().await;
                if let Some(conn) = self.memcached_ready(&mut guard).await {
                    if let Err(err) = conn.set(&key, ttl, data).await {
                        warn!("memcached insert failed: {err}");
                        *guard = None;
                        return Ok(());
                    }
                    drop(guard);
                    self.oidmap
                        .register(database, tables, OidMapRecord::Key(key))?;
                }
            }
        }
        Ok(())
    }

    pub async fn delete(&self, key: &CacheKey) {
        match &self.backend {
            Backend::Shmem(shmem) => {
                let result = shmem.write().delete(key);
                if let Err(err) = result {
                    self.recover(err);
                }
            }
            Backend::Memcached(client) => {
                let mut guard = client.lock().await;
                if let Some(conn) = self.memcached_ready(&mut guard).await {
                    if let Err(err) = conn.delete(key).await {
                        warn!("memcached delete failed: {err}");
                        *guard = None;
                    }
                }
            }
        }
    }

    /// Invalidate every entry depending on any of the given tables.
    pub async fn invalidate_tables(&self, database: Oid, tables: &[Oid]) {
        for &table in tables {
            let records = self.oidmap.take_dependents(database, table);
            self.delete_records(records).await;
        }
    }

    /// DROP DATABASE invalidation: the whole oid-map subtree.
    pub async fn invalidate_database(&self, database: Oid) {
        let records = self.oidmap.take_database(database);
        self.delete_records(records).await;
    }

    async fn delete_records(&self, records: Vec<OidMapRecord>) {
        for record in records {
            match (record, &self.backend) {
                (OidMapRecord::CacheId(cacheid), Backend::Shmem(shmem)) => {
                    let result = shmem.write().delete_by_cacheid(cacheid);
                    if let Err(err) = result {
                        self.recover(err);
                        return;
                    }
                }
                (OidMapRecord::Key(key), _) => self.delete(&key).await,
                (OidMapRecord::CacheId(_), Backend::Memcached(_)) => {
                    warn!("oid map record kind does not match cache method");
                }
            }
        }
    }

    /// Consistency failure: reset the whole cache and keep serving.
    fn recover(&self, err: Error) {
        error!("query cache corrupted, resetting: {err}");
        if let Backend::Shmem(shmem) = &self.backend {
            shmem.write().clear();
        }
        self.oidmap.clear();
    }

    async fn memcached_ready<'a>(
        &self,
        guard: &'a mut Option<memcached::MemcachedClient>,
    ) -> Option<&'a mut memcached::MemcachedClient> {
        if guard.is_none() {
            match memcached::MemcachedClient::connect(
                &self.settings.memcached_host,
                self.settings.memcached_port,
            )
            .await
            {
                Ok(conn) => *guard = Some(conn),
                Err(err) => {
                    warn!("memcached connection failed: {err}");
                    return None;
                }
            }
        }
        guard.as_mut()
    }
}
