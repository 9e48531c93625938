//! Statement classification: destination, cache safety, written relations.

use crate::config::{CacheSettings, Routing};
use crate::parser::ast::{CopyTarget, LockMode, SelectStmt, Stmt, TableRef, TransactionVerb};

/// Where a statement may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Must run on the write node.
    Primary,
    /// Could run on a standby alone (currently unproduced; kept for the
    /// decision table's completeness).
    Standby,
    /// Read-only; any one node will do.
    Either,
    /// Must run everywhere.
    Both,
}

/// Built-in functions known to be volatile; consulted when the operator
/// configures no function lists.
const VOLATILE_BUILTINS: &[&str] = &[
    "now",
    "random",
    "nextval",
    "currval",
    "setval",
    "lastval",
    "txid_current",
    "pg_sleep",
    "clock_timestamp",
    "statement_timestamp",
    "timeofday",
    "gen_random_uuid",
    "uuid_generate_v4",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_advisory_lock",
    "pg_try_advisory_lock",
    "pg_advisory_unlock",
];

/// The destination decision table.
pub fn send_destination(stmt: &Stmt) -> Destination {
    match stmt {
        Stmt::Select(select) => {
            if select.has_select_into || select.has_locking_clause || select.has_modifying_cte() {
                Destination::Primary
            } else {
                Destination::Either
            }
        }

        Stmt::Copy { is_from: true, .. } => Destination::Primary,
        Stmt::Copy {
            target: CopyTarget::Query { is_select },
            ..
        } => {
            if *is_select {
                Destination::Either
            } else {
                Destination::Primary
            }
        }
        Stmt::Copy { .. } => Destination::Either,

        Stmt::Lock { mode, .. } => {
            if *mode >= LockMode::RowExclusive {
                Destination::Primary
            } else {
                Destination::Both
            }
        }

        Stmt::Transaction(verb) => match verb {
            TransactionVerb::PrepareTransaction(_)
            | TransactionVerb::CommitPrepared(_)
            | TransactionVerb::RollbackPrepared(_) => Destination::Primary,
            // BEGIN (rewritten for standbys where needed), COMMIT, ROLLBACK,
            // and savepoints go everywhere.
            _ => Destination::Both,
        },

        Stmt::Set(set) => set_destination(set),
        Stmt::Show { .. } => Destination::Either,
        Stmt::Discard { .. } => Destination::Both,

        Stmt::Prepare { query, .. } => send_destination(query),
        // Temporary; the router copies the PREPARE's bitmap afterwards.
        Stmt::Execute { .. } => Destination::Primary,
        Stmt::Deallocate { .. } => Destination::Primary,

        Stmt::Explain { analyze, query } => {
            if send_destination(query) == Destination::Primary || (*analyze && query.is_write()) {
                Destination::Primary
            } else {
                Destination::Either
            }
        }

        _ => Destination::Primary,
    }
}

fn set_destination(set: &crate::parser::ast::VariableSetStmt) -> Destination {
    let has = |word: &str| set.args.iter().any(|a| a == word);

    match set.name.as_str() {
        "transaction_read_only" => {
            let turns_off = set.args.iter().any(|a| {
                a == "off" || a == "f" || a == "false" || a.parse::<i64>().map_or(false, |v| v != 0)
            });
            if turns_off {
                Destination::Primary
            } else {
                Destination::Both
            }
        }
        "transaction_isolation" | "default_transaction_isolation" => {
            if has("serializable") {
                Destination::Primary
            } else {
                Destination::Both
            }
        }
        "transaction" | "session characteristics" => {
            if has("serializable") {
                Destination::Primary
            } else if has("read") && has("write") {
                Destination::Primary
            } else {
                Destination::Both
            }
        }
        _ => Destination::Both,
    }
}

/// Does a SELECT call anything that may write or return unstable results?
/// The operator's allow list wins, then the deny list, then the builtin
/// volatility catalog.
pub fn has_unsafe_function_call(select: &SelectStmt, routing: &Routing) -> bool {
    if select.functions.is_empty() {
        return false;
    }
    if !routing.read_only_function_list.is_empty() {
        return select
            .functions
            .iter()
            .any(|f| !routing.read_only_function_list.contains(f));
    }
    if !routing.write_function_list.is_empty() {
        return select
            .functions
            .iter()
            .any(|f| routing.write_function_list.contains(f));
    }
    select
        .functions
        .iter()
        .any(|f| VOLATILE_BUILTINS.contains(&f.as_str()))
}

fn matches_any(patterns: &[String], table: &TableRef) -> bool {
    patterns.iter().any(|pattern| {
        if let Ok(re) = regex::Regex::new(pattern) {
            re.is_match(&table.name) || re.is_match(&table.qualified_name())
        } else {
            pattern == &table.name || pattern == &table.qualified_name()
        }
    })
}

/// Cache-safety per the rules in the cache design: no volatile function, no
/// catalog read, no temp/unlogged table, no TABLESAMPLE, no locking clause,
/// no SELECT INTO, no modifying CTE, nothing on the deny list.
/// `table_is_volatile` reports temp/unlogged status known to the session.
pub fn is_cacheable(
    select: &SelectStmt,
    routing: &Routing,
    cache: &CacheSettings,
    table_is_volatile: &dyn Fn(&TableRef) -> bool,
) -> bool {
    if select.has_select_into
        || select.has_locking_clause
        || select.has_tablesample
        || select.has_modifying_cte()
    {
        return false;
    }
    if has_unsafe_function_call(select, routing) {
        return false;
    }
    for table in &select.tables {
        if matches_any(&cache.unsafe_table_list, table) {
            return false;
        }
        if matches_any(&cache.safe_table_list, table) {
            continue;
        }
        if table.is_system_catalog() || table_is_volatile(table) {
            return false;
        }
    }
    true
}

/// Relations whose contents the statement changes; drives oid extraction
/// for cache invalidation.
pub fn written_tables(stmt: &Stmt) -> Vec<TableRef> {
    match stmt {
        Stmt::Insert { table } | Stmt::Update { table } | Stmt::Delete { table } => {
            vec![table.clone()]
        }
        Stmt::Truncate { tables } | Stmt::DropTable { tables } => tables.clone(),
        Stmt::AlterTable { table } => vec![table.clone()],
        Stmt::Copy {
            target: CopyTarget::Table(table),
            is_from: true,
        } => vec![table.clone()],
        Stmt::Select(select) => select.cte_write_tables.clone(),
        Stmt::Explain { analyze: true, query } => written_tables(query),
        Stmt::Prepare { query, .. } => written_tables(query),
        _ => Vec::new(),
    }
}
