//! On-disk table-oid map: which cache entries depend on which tables.
//!
//! Layout: `<dir>/<database_oid>/<table_oid>`, each file a concatenation of
//! records naming dependent cache entries. The shared-memory backend stores
//! 8-byte `(blockid, itemid)` pairs; the memcached backend stores the
//! 16-byte fingerprints themselves.

use std::io::Write;
use std::path::PathBuf;

use log::warn;

use crate::cache::hashtable::CacheId;
use crate::cache::CacheKey;
use crate::errors::Error;
use crate::parser::ast::Oid;

/// One dependency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OidMapRecord {
    CacheId(CacheId),
    Key(CacheKey),
}

pub struct OidMap {
    dir: PathBuf,
    /// Record width: 8 for `(blockid, itemid)`, 16 for fingerprints.
    record_len: usize,
}

impl OidMap {
    pub fn new(dir: impl Into<PathBuf>, stores_keys: bool) -> Self {
        Self {
            dir: dir.into(),
            record_len: if stores_keys { 16 } else { 8 },
        }
    }

    fn table_path(&self, database: Oid, table: Oid) -> PathBuf {
        self.dir.join(database.to_string()).join(table.to_string())
    }

    fn encode(&self, record: &OidMapRecord) -> Vec<u8> {
        match record {
            OidMapRecord::CacheId(cacheid) => {
                let mut bytes = Vec::with_capacity(8);
                bytes.extend_from_slice(&cacheid.block.to_be_bytes());
                bytes.extend_from_slice(&cacheid.item.to_be_bytes());
                bytes
            }
            OidMapRecord::Key(key) => key.0.to_vec(),
        }
    }

    fn decode(&self, bytes: &[u8]) -> OidMapRecord {
        if self.record_len == 8 {
            OidMapRecord::CacheId(CacheId {
                block: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
                item: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            })
        } else {
            let mut key = [0u8; 16];
            key.copy_from_slice(bytes);
            OidMapRecord::Key(CacheKey(key))
        }
    }

    /// Append one dependency record per referenced table.
    pub fn register(
        &self,
        database: Oid,
        tables: &[Oid],
        record: OidMapRecord,
    ) -> Result<(), Error> {
        let encoded = self.encode(&record);
        debug_assert_eq!(encoded.len(), self.record_len);

        for &table in tables {
            let path = self.table_path(database, table);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    Error::CacheCorrupt(format!("could not create oid map directory: {err}"))
                })?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|err| {
                    Error::CacheCorrupt(format!("could not open oid map file {path:?}: {err}"))
                })?;
            file.write_all(&encoded).map_err(|err| {
                Error::CacheCorrupt(format!("could not append to oid map file {path:?}: {err}"))
            })?;
        }
        Ok(())
    }

    /// All records depending on the table; the file is unlinked so the
    /// entries invalidate exactly once.
    pub fn take_dependents(&self, database: Oid, table: Oid) -> Vec<OidMapRecord> {
        let path = self.table_path(database, table);
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!("could not read oid map file {path:?}: {err}");
                return Vec::new();
            }
        };
        if let Err(err) = std::fs::remove_file(&path) {
            warn!("could not unlink oid map file {path:?}: {err}");
        }
        contents
            .chunks_exact(self.record_len)
            .map(|chunk| self.decode(chunk))
            .collect()
    }

    /// DROP DATABASE: every record of every table of the database, and the
    /// whole subtree removed.
    pub fn take_database(&self, database: Oid) -> Vec<OidMapRecord> {
        let dir = self.dir.join(database.to_string());
        let mut records = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return records,
        };
        for entry in entries.flatten() {
            if let Ok(contents) = std::fs::read(entry.path()) {
                records.extend(
                    contents
                        .chunks_exact(self.record_len)
                        .map(|chunk| self.decode(chunk)),
                );
            }
        }
        if let Err(err) = std::fs::remove_dir_all(&dir) {
            warn!("could not remove oid map directory {dir:?}: {err}");
        }
        records
    }

    /// Wipe the whole map (cache reset).
    pub fn clear(&self) {
        if self.dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.dir) {
                warn!("could not clear oid map directory {:?}: {err}", self.dir);
            }
        }
    }
}
