//! Relation cache: `schema.table` to oid and persistence.
//!
//! Sessions fill it by querying the primary's catalog; the cache keeps the
//! answers so the lookup query runs once per relation, not once per
//! statement.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::parser::ast::{Oid, TableRef};

/// What routing and invalidation need to know about one relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelInfo {
    pub oid: Oid,
    pub is_temp: bool,
    pub is_unlogged: bool,
}

/// The catalog query a session runs on a relcache miss. One text row:
/// `oid` and `relpersistence` (p/u/t).
pub fn relcache_lookup_query(table: &TableRef) -> String {
    let schema_filter = match &table.schema {
        Some(schema) => format!("n.nspname = '{}'", escape_literal(schema)),
        None => "pg_catalog.pg_table_is_visible(c.oid)".to_string(),
    };
    format!(
        "SELECT c.oid, c.relpersistence FROM pg_catalog.pg_class c \
         JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
         WHERE c.relname = '{}' AND {schema_filter}",
        escape_literal(&table.name)
    )
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Parse the two columns of the lookup result into a `RelInfo`.
pub fn relinfo_from_row(oid: &str, relpersistence: &str) -> Option<RelInfo> {
    Some(RelInfo {
        oid: oid.parse().ok()?,
        is_temp: relpersistence == "t",
        is_unlogged: relpersistence == "u",
    })
}

pub struct Relcache {
    entries: LruCache<String, RelInfo>,
}

impl Relcache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1"),
            ),
        }
    }

    pub fn get(&mut self, table: &TableRef) -> Option<RelInfo> {
        self.entries.get(&table.qualified_name()).copied()
    }

    pub fn insert(&mut self, table: &TableRef, info: RelInfo) {
        self.entries.put(table.qualified_name(), info);
    }

    /// Drop one relation, e.g. after DROP TABLE.
    pub fn forget(&mut self, table: &TableRef) {
        self.entries.pop(&table.qualified_name());
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_query_filters_schema() {
        let q = relcache_lookup_query(&TableRef::new(Some("app"), "users"));
        assert!(q.contains("c.relname = 'users'"));
        assert!(q.contains("n.nspname = 'app'"));

        let q = relcache_lookup_query(&TableRef::bare("users"));
        assert!(q.contains("pg_table_is_visible"));
    }

    #[test]
    fn literals_are_escaped() {
        let q = relcache_lookup_query(&TableRef::bare("o'brien"));
        assert!(q.contains("'o''brien'"));
    }

    #[test]
    fn cache_round_trip_and_eviction() {
        let mut cache = Relcache::new(2);
        let a = TableRef::bare("a");
        let b = TableRef::bare("b");
        let c = TableRef::bare("c");
        let info = RelInfo {
            oid: 16384,
            is_temp: false,
            is_unlogged: false,
        };
        cache.insert(&a, info);
        cache.insert(&b, info);
        cache.insert(&c, info); // evicts a
        assert!(cache.get(&a).is_none());
        assert_eq!(cache.get(&b), Some(info));

        cache.forget(&b);
        assert!(cache.get(&b).is_none());
    }

    #[test]
    fn relpersistence_mapping() {
        assert_eq!(
            relinfo_from_row("16385", "p").unwrap(),
            RelInfo {
                oid: 16385,
                is_temp: false,
                is_unlogged: false
            }
        );
        assert!(relinfo_from_row("16385", "t").unwrap().is_temp);
        assert!(relinfo_from_row("16385", "u").unwrap().is_unlogged);
        assert!(relinfo_from_row("not-a-number", "p").is_none());
    }
}
