//! The routing decision: which backends receive a statement.

pub mod classifier;
pub mod relcache;

use log::debug;

use crate::backend::status::Cluster;
use crate::config::{ClusterMode, DisableLoadBalanceOnWrite, Routing};
use crate::context::query::QueryContext;
use crate::context::session::{SentMessageKind, SessionContext};
use crate::errors::Error;
use crate::parser::ast::{IsolationLevel, SelectStmt, Stmt, TableRef, TransactionVerb};
use crate::parser::parse_all;

pub use classifier::{
    has_unsafe_function_call, is_cacheable, send_destination, written_tables, Destination,
};
pub use relcache::{relcache_lookup_query, relinfo_from_row, RelInfo, Relcache};

/// Everything the routing decision reads besides the session itself.
pub struct RoutingEnv<'a> {
    pub cluster: &'a Cluster,
    pub routing: &'a Routing,
    /// Backend process ids learned from BackendKeyData, slot-indexed;
    /// zero when unknown.
    pub backend_pids: &'a [i32],
    /// Relation info resolved ahead of routing (relcache contents).
    pub rel_info: &'a dyn Fn(&TableRef) -> Option<RelInfo>,
    /// Fresh randomness for the statement-level load-balance re-pick.
    pub lb_roll: u64,
}

/// Fill `where_to_send` for one statement. Mirrors the shape of the
/// decision tree the classifier feeds: cluster mode first, destination
/// class second, load-balance preconditions last.
pub fn where_to_send(
    env: &RoutingEnv,
    session: &mut SessionContext,
    qc: &mut QueryContext,
) -> Result<(), Error> {
    qc.clear_nodes();

    match env.cluster.mode() {
        ClusterMode::Raw => {
            let main = env.cluster.main_node_id().ok_or(Error::BackendDown(0))?;
            qc.set_node(main);
        }
        ClusterMode::StreamingReplication => route_streaming(env, session, qc)?,
        ClusterMode::NativeReplication => route_native(env, session, qc)?,
    }

    // EXECUTE inherits the PREPARE's bitmap; DEALLOCATE likewise, or fans
    // out for DEALLOCATE ALL.
    let inherit_from = match &qc.query.stmt {
        Stmt::Execute { name } => Some((name.clone(), true)),
        Stmt::Deallocate { name: Some(name) } => Some((name.clone(), false)),
        Stmt::Deallocate { name: None } => {
            set_all_up(env.cluster, qc);
            None
        }
        _ => None,
    };
    if let Some((name, with_lb_node)) = inherit_from {
        if let Some(sent) = session.find_prepared(&name) {
            if let Some(prepared) = session.queries.get(sent.query_handle) {
                qc.where_to_send = prepared.where_to_send;
                if with_lb_node {
                    qc.load_balance_node_id = prepared.load_balance_node_id;
                }
            }
        }
    }

    qc.update_virtual_main_node();
    debug!(
        "routing: query={:?} nodes={:?} virtual_main={:?}",
        qc.query.text.chars().take(60).collect::<String>(),
        qc.where_to_send.iter().collect::<Vec<_>>(),
        qc.virtual_main_node_id
    );
    Ok(())
}

fn set_all_up(cluster: &Cluster, qc: &mut QueryContext) {
    for node_id in 0..cluster.num_backends() {
        if cluster.is_up(node_id) {
            qc.set_node(node_id);
        }
    }
}

fn route_streaming(
    env: &RoutingEnv,
    session: &mut SessionContext,
    qc: &mut QueryContext,
) -> Result<(), Error> {
    let primary = env.cluster.primary_or_main()?;

    // A multi-statement query is routed whole to the primary: only the
    // first statement is parsed, and the rest could write. All top-level
    // statements still feed the writing-transaction latch.
    if qc.query.is_multi_statement {
        if let Ok(all) = parse_all(&qc.query.text) {
            if all.iter().any(|s| s.is_write()) && session.in_transaction_on(primary) {
                session.set_writing_transaction();
            }
        }
        qc.set_node(primary);
        return Ok(());
    }

    let dest = send_destination(&qc.query.stmt);
    dml_adaptive_note(env.routing, session, &qc.query.stmt);

    // BEGIN READ WRITE / SERIALIZABLE: primary keeps the original text,
    // standbys get a plain BEGIN.
    let begin_rewrite = matches!(
        &qc.query.stmt,
        Stmt::Transaction(TransactionVerb::Begin(opts)) if opts.needs_rewrite()
    );
    if begin_rewrite {
        qc.rewritten_query = Some("BEGIN".to_string());
    }

    // A SELECT naming pg_terminate_backend(pid) goes to the node hosting
    // that pid, whatever the read/write policy says.
    let terminate_pid = match &qc.query.stmt {
        Stmt::Select(select) => select.terminate_backend_pid,
        _ => None,
    };
    if let Some(pid) = terminate_pid {
        if let Some(node_id) = env.backend_pids.iter().position(|&p| p != 0 && p == pid) {
            qc.set_node(node_id);
            return Ok(());
        }
    }

    match dest {
        Destination::Primary => qc.set_node(primary),
        Destination::Both => set_all_up(env.cluster, qc),
        Destination::Either | Destination::Standby => {
            if session.is_writing_transaction()
                && env.routing.disable_load_balance_on_write == DisableLoadBalanceOnWrite::Always
            {
                qc.set_node(primary);
            } else if env.routing.load_balance_mode && qc.query.stmt.is_select() {
                route_select(env, session, qc, primary)?;
            } else {
                qc.set_node(primary);
            }
        }
    }
    Ok(())
}

/// Load-balance preconditions and the per-SELECT primary overrides.
fn route_select(
    env: &RoutingEnv,
    session: &mut SessionContext,
    qc: &mut QueryContext,
    primary: usize,
) -> Result<(), Error> {
    let select = match &qc.query.stmt {
        Stmt::Select(select) => select.clone(),
        _ => {
            qc.set_node(primary);
            return Ok(());
        }
    };

    let outside_transaction = !session.in_transaction_on(primary);
    let may_balance = outside_transaction
        || (!effective_writing(env.routing, session)
            && !session.failed_transaction
            && session.transaction_isolation != Some(IsolationLevel::Serializable));

    if !may_balance {
        qc.set_node(primary);
        return Ok(());
    }

    let lb = session.load_balance_node_id;
    let delayed = env.routing.delay_threshold > 0
        && lb != primary
        && env.cluster.standby_delay(lb) > env.routing.delay_threshold;

    if delayed {
        if env.routing.prefer_lower_delay_standby {
            let new_lb = env.cluster.least_delayed_standby().unwrap_or(primary);
            session.load_balance_node_id = new_lb;
            qc.load_balance_node_id = Some(new_lb);
            qc.set_node(new_lb);
        } else {
            qc.set_node(primary);
        }
        return Ok(());
    }

    if selects_system_catalog(&select)
        || (env.routing.check_temp_table && selects_temp_table(env, session, &select))
        || (env.routing.check_unlogged_table && selects_unlogged_table(env, &select))
        || matches_primary_pattern(env.routing, &qc.query.text)
        || has_unsafe_function_call(&select, env.routing)
        || selects_written_object(env.routing, session, &select)
    {
        qc.set_node(primary);
        return Ok(());
    }

    if env.routing.statement_level_load_balance {
        session.load_balance_node_id = env.cluster.select_load_balance_node(env.lb_roll);
    }
    qc.load_balance_node_id = Some(session.load_balance_node_id);
    qc.set_node(session.load_balance_node_id);
    Ok(())
}

fn route_native(
    env: &RoutingEnv,
    session: &mut SessionContext,
    qc: &mut QueryContext,
) -> Result<(), Error> {
    let main = env.cluster.main_node_id().ok_or(Error::BackendDown(0))?;

    if qc.query.is_multi_statement {
        if let Ok(all) = parse_all(&qc.query.text) {
            if all.iter().any(|s| s.is_write()) && session.in_transaction_on(main) {
                session.set_writing_transaction();
            }
        }
        set_all_up(env.cluster, qc);
        return Ok(());
    }

    dml_adaptive_note(env.routing, session, &qc.query.stmt);

    let is_select = qc.query.stmt.is_select();
    let function_call = matches!(&qc.query.stmt, Stmt::Select(s) if has_unsafe_function_call(s, env.routing));

    if env.routing.load_balance_mode && is_select {
        if function_call || env.routing.replicate_select {
            set_all_up(env.cluster, qc);
        } else if !session.in_transaction_on(main)
            || (!effective_writing(env.routing, session)
                && !session.failed_transaction
                && session.transaction_isolation != Some(IsolationLevel::Serializable))
        {
            qc.load_balance_node_id = Some(session.load_balance_node_id);
            qc.set_node(session.load_balance_node_id);
        } else {
            qc.set_node(main);
        }
    } else if is_select && !env.routing.replicate_select && !function_call {
        qc.set_node(main);
    } else {
        // Writes and utilities replicate everywhere.
        set_all_up(env.cluster, qc);
    }
    Ok(())
}

fn effective_writing(routing: &Routing, session: &SessionContext) -> bool {
    match routing.disable_load_balance_on_write {
        DisableLoadBalanceOnWrite::Off => false,
        DisableLoadBalanceOnWrite::Transaction | DisableLoadBalanceOnWrite::Always => {
            session.is_writing_transaction()
        }
        DisableLoadBalanceOnWrite::TransTransaction => session.ever_wrote_in_transaction(),
        DisableLoadBalanceOnWrite::DmlAdaptive => false,
    }
}

fn dml_adaptive_note(routing: &Routing, session: &mut SessionContext, stmt: &Stmt) {
    if routing.disable_load_balance_on_write != DisableLoadBalanceOnWrite::DmlAdaptive {
        return;
    }
    for table in written_tables(stmt) {
        session.note_dml_object(table.qualified_name());
    }
}

fn selects_system_catalog(select: &SelectStmt) -> bool {
    select.tables.iter().any(|t| t.is_system_catalog())
}

fn selects_temp_table(env: &RoutingEnv, session: &SessionContext, select: &SelectStmt) -> bool {
    select.tables.iter().any(|t| {
        session.has_temp_table(&t.name)
            || (env.rel_info)(t).is_some_and(|info| info.is_temp)
    })
}

fn selects_unlogged_table(env: &RoutingEnv, select: &SelectStmt) -> bool {
    select
        .tables
        .iter()
        .any(|t| (env.rel_info)(t).is_some_and(|info| info.is_unlogged))
}

fn matches_primary_pattern(routing: &Routing, text: &str) -> bool {
    routing.primary_routing_query_pattern_list.iter().any(|pattern| {
        regex::Regex::new(pattern)
            .map(|re| re.is_match(text))
            .unwrap_or(false)
    })
}

fn selects_written_object(
    routing: &Routing,
    session: &SessionContext,
    select: &SelectStmt,
) -> bool {
    routing.disable_load_balance_on_write == DisableLoadBalanceOnWrite::DmlAdaptive
        && select
            .tables
            .iter()
            .any(|t| session.wrote_object(&t.qualified_name()))
}

#[cfg(test)]
mod tests;
