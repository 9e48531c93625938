//! Tests for the routing decision.

use super::*;
use crate::backend::status::{BackendStatus, Cluster};
use crate::config::{BackendConfig, Config};
use crate::context::query::QueryContext;
use crate::context::session::{SentMessage, SentMessageKind, SentMessageState};
use crate::parser::parse;

fn cluster(mode: ClusterMode, n: usize) -> Cluster {
    let config = Config {
        backends: (0..n)
            .map(|i| BackendConfig {
                host: format!("pg{i}"),
                port: 5432,
                weight: 1,
                primary: i == 0 && mode == ClusterMode::StreamingReplication,
                allow_to_failover: true,
            })
            .collect(),
        routing: Routing {
            mode,
            ..Default::default()
        },
        ..Default::default()
    };
    let cluster = Cluster::from_config(&config).unwrap();
    for i in 0..n {
        cluster.set_status(i, BackendStatus::Up);
    }
    cluster
}

fn route(
    cluster: &Cluster,
    routing: &Routing,
    session: &mut SessionContext,
    text: &str,
) -> QueryContext {
    let mut qc = QueryContext::new(parse(text).unwrap(), cluster.num_backends());
    let env = RoutingEnv {
        cluster,
        routing,
        backend_pids: &[0; 8][..cluster.num_backends()],
        rel_info: &|_| None,
        lb_roll: 1,
    };
    where_to_send(&env, session, &mut qc).unwrap();
    qc
}

fn nodes(qc: &QueryContext) -> Vec<usize> {
    qc.where_to_send.iter().collect()
}

#[test]
fn raw_mode_targets_main_only() {
    let c = cluster(ClusterMode::Raw, 1);
    let routing = Routing {
        mode: ClusterMode::Raw,
        ..Default::default()
    };
    let mut s = SessionContext::new(1, 1, 0);
    let qc = route(&c, &routing, &mut s, "UPDATE t SET x = 1");
    assert_eq!(nodes(&qc), vec![0]);
    assert_eq!(qc.virtual_main_node_id, Some(0));
}

#[test]
fn writes_hit_primary_reads_hit_load_balance_node() {
    let c = cluster(ClusterMode::StreamingReplication, 3);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 3, 2);

    let qc = route(&c, &routing, &mut s, "INSERT INTO t VALUES (1)");
    assert_eq!(nodes(&qc), vec![0]);

    let qc = route(&c, &routing, &mut s, "SELECT * FROM t");
    assert_eq!(nodes(&qc), vec![2]);
    assert_eq!(qc.load_balance_node_id, Some(2));
    assert_eq!(qc.virtual_main_node_id, Some(2));
}

#[test]
fn begin_fans_out_and_rewrites() {
    let c = cluster(ClusterMode::StreamingReplication, 3);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 3, 1);

    let qc = route(&c, &routing, &mut s, "BEGIN READ WRITE");
    assert_eq!(nodes(&qc), vec![0, 1, 2]);
    assert_eq!(qc.rewritten_query.as_deref(), Some("BEGIN"));
    // Primary keeps the original, standbys get the rewrite.
    assert_eq!(qc.text_for_node(0, Some(0)), "BEGIN READ WRITE");
    assert_eq!(qc.text_for_node(1, Some(0)), "BEGIN");

    let qc = route(&c, &routing, &mut s, "BEGIN");
    assert_eq!(qc.rewritten_query, None);
}

#[test]
fn multi_statement_goes_to_primary_whole() {
    let c = cluster(ClusterMode::StreamingReplication, 3);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 3, 1);
    let qc = route(&c, &routing, &mut s, "BEGIN; DELETE FROM t; END");
    assert_eq!(nodes(&qc), vec![0]);
}

#[test]
fn routing_exclusivity_virtual_main_is_first_bit() {
    let c = cluster(ClusterMode::StreamingReplication, 3);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 3, 1);
    for text in [
        "SELECT 1",
        "INSERT INTO t VALUES (1)",
        "BEGIN",
        "SET search_path TO public",
        "VACUUM t",
    ] {
        let qc = route(&c, &routing, &mut s, text);
        let nodes = nodes(&qc);
        assert!(!nodes.is_empty(), "{text} routed nowhere");
        assert_eq!(qc.virtual_main_node_id, Some(nodes[0]), "{text}");
    }
}

#[test]
fn writing_transaction_pins_reads_to_primary() {
    let c = cluster(ClusterMode::StreamingReplication, 2);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 2, 1);

    // Inside a transaction that wrote, reads go to the primary.
    s.set_tx_state(0, b'T');
    s.set_writing_transaction();
    let qc = route(&c, &routing, &mut s, "SELECT * FROM t");
    assert_eq!(nodes(&qc), vec![0]);

    // Transaction over: reads balance again.
    s.set_tx_state(0, b'I');
    s.transaction_ended(true);
    let qc = route(&c, &routing, &mut s, "SELECT * FROM t");
    assert_eq!(nodes(&qc), vec![1]);
}

#[test]
fn serializable_isolation_pins_reads() {
    let c = cluster(ClusterMode::StreamingReplication, 2);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 2, 1);
    s.set_tx_state(0, b'T');
    s.transaction_isolation = Some(IsolationLevel::Serializable);
    let qc = route(&c, &routing, &mut s, "SELECT * FROM t");
    assert_eq!(nodes(&qc), vec![0]);
}

#[test]
fn failed_transaction_pins_reads() {
    let c = cluster(ClusterMode::StreamingReplication, 2);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 2, 1);
    s.set_tx_state(0, b'T');
    s.failed_transaction = true;
    let qc = route(&c, &routing, &mut s, "SELECT * FROM t");
    assert_eq!(nodes(&qc), vec![0]);
}

#[test]
fn catalog_and_volatile_selects_hit_primary() {
    let c = cluster(ClusterMode::StreamingReplication, 2);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 2, 1);

    let qc = route(&c, &routing, &mut s, "SELECT * FROM pg_class");
    assert_eq!(nodes(&qc), vec![0]);

    let qc = route(&c, &routing, &mut s, "SELECT nextval('seq')");
    assert_eq!(nodes(&qc), vec![0]);
}

#[test]
fn temp_table_select_hits_primary() {
    let c = cluster(ClusterMode::StreamingReplication, 2);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 2, 1);
    s.temp_table_creating("scratch");
    let qc = route(&c, &routing, &mut s, "SELECT * FROM scratch");
    assert_eq!(nodes(&qc), vec![0]);
}

#[test]
fn unlogged_table_select_hits_primary_via_relcache() {
    let c = cluster(ClusterMode::StreamingReplication, 2);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 2, 1);
    let mut qc = QueryContext::new(parse("SELECT * FROM fast").unwrap(), 2);
    let env = RoutingEnv {
        cluster: &c,
        routing: &routing,
        backend_pids: &[0, 0],
        rel_info: &|t| {
            (t.name == "fast").then_some(RelInfo {
                oid: 77,
                is_temp: false,
                is_unlogged: true,
            })
        },
        lb_roll: 1,
    };
    where_to_send(&env, &mut s, &mut qc).unwrap();
    assert_eq!(nodes(&qc), vec![0]);
}

#[test]
fn primary_routing_pattern_list() {
    let c = cluster(ClusterMode::StreamingReplication, 2);
    let routing = Routing {
        primary_routing_query_pattern_list: vec![r"(?i).*\bfresh_data\b.*".into()],
        ..Default::default()
    };
    let mut s = SessionContext::new(1, 2, 1);
    let qc = route(&c, &routing, &mut s, "SELECT * FROM fresh_data");
    assert_eq!(nodes(&qc), vec![0]);
    let qc = route(&c, &routing, &mut s, "SELECT * FROM other");
    assert_eq!(nodes(&qc), vec![1]);
}

#[test]
fn delay_threshold_redirects() {
    let c = cluster(ClusterMode::StreamingReplication, 3);
    c.set_standby_delay(1, 10_000_000);
    c.set_standby_delay(2, 10);
    let mut routing = Routing {
        delay_threshold: 1_000,
        ..Default::default()
    };
    let mut s = SessionContext::new(1, 3, 1);

    // Too delayed, no preference: primary takes the read.
    let qc = route(&c, &routing, &mut s, "SELECT * FROM t");
    assert_eq!(nodes(&qc), vec![0]);

    // With the preference, the least-delayed standby is re-elected.
    routing.prefer_lower_delay_standby = true;
    s.load_balance_node_id = 1;
    let qc = route(&c, &routing, &mut s, "SELECT * FROM t");
    assert_eq!(nodes(&qc), vec![2]);
    assert_eq!(s.load_balance_node_id, 2);
}

#[test]
fn dml_adaptive_routes_read_your_write_to_primary() {
    let c = cluster(ClusterMode::StreamingReplication, 2);
    let routing = Routing {
        disable_load_balance_on_write: DisableLoadBalanceOnWrite::DmlAdaptive,
        ..Default::default()
    };
    let mut s = SessionContext::new(1, 2, 1);
    s.set_tx_state(0, b'T');

    let _ = route(&c, &routing, &mut s, "UPDATE accounts SET v = 1");
    let qc = route(&c, &routing, &mut s, "SELECT * FROM accounts");
    assert_eq!(nodes(&qc), vec![0]);
    let qc = route(&c, &routing, &mut s, "SELECT * FROM branches");
    assert_eq!(nodes(&qc), vec![1]);
}

#[test]
fn always_policy_pins_after_any_write() {
    let c = cluster(ClusterMode::StreamingReplication, 2);
    let routing = Routing {
        disable_load_balance_on_write: DisableLoadBalanceOnWrite::Always,
        ..Default::default()
    };
    let mut s = SessionContext::new(1, 2, 1);
    s.set_writing_transaction();
    s.transaction_ended(true);
    // Even outside the transaction the session stays pinned.
    s.set_writing_transaction();
    let qc = route(&c, &routing, &mut s, "SELECT * FROM t");
    assert_eq!(nodes(&qc), vec![0]);
}

#[test]
fn execute_inherits_prepare_bitmap() {
    let c = cluster(ClusterMode::StreamingReplication, 3);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 3, 2);

    // PREPARE ... AS SELECT routes like a read; remember it.
    let mut prepare_qc = QueryContext::new(
        parse("PREPARE q AS SELECT * FROM accounts WHERE id = $1").unwrap(),
        3,
    );
    let env = RoutingEnv {
        cluster: &c,
        routing: &routing,
        backend_pids: &[0, 0, 0],
        rel_info: &|_| None,
        lb_roll: 1,
    };
    where_to_send(&env, &mut s, &mut prepare_qc).unwrap();
    assert_eq!(nodes(&prepare_qc), vec![2]);

    let handle = s.start_query(prepare_qc);
    s.add_sent_message(SentMessage {
        kind: SentMessageKind::Query,
        name: "q".into(),
        bytes: bytes::BytesMut::new(),
        query_handle: handle,
        state: SentMessageState::Created,
    });
    s.unset_query_in_progress();

    // EXECUTE picks up the same bitmap even though its own class is write.
    let qc = route(&c, &routing, &mut s, "EXECUTE q");
    assert_eq!(nodes(&qc), vec![2]);

    // DEALLOCATE of that statement follows it; DEALLOCATE ALL fans out.
    let qc = route(&c, &routing, &mut s, "DEALLOCATE q");
    assert_eq!(nodes(&qc), vec![2]);
    let qc = route(&c, &routing, &mut s, "DEALLOCATE ALL");
    assert_eq!(nodes(&qc), vec![0, 1, 2]);
}

#[test]
fn terminate_backend_overrides_policy() {
    let c = cluster(ClusterMode::StreamingReplication, 3);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 3, 1);
    let mut qc = QueryContext::new(parse("SELECT pg_terminate_backend(4242)").unwrap(), 3);
    let env = RoutingEnv {
        cluster: &c,
        routing: &routing,
        backend_pids: &[100, 4242, 300],
        rel_info: &|_| None,
        lb_roll: 1,
    };
    where_to_send(&env, &mut s, &mut qc).unwrap();
    assert_eq!(nodes(&qc), vec![1]);
}

#[test]
fn native_replication_fans_out_writes() {
    let c = cluster(ClusterMode::NativeReplication, 2);
    let routing = Routing {
        mode: ClusterMode::NativeReplication,
        ..Default::default()
    };
    let mut s = SessionContext::new(1, 2, 1);

    let qc = route(&c, &routing, &mut s, "UPDATE t SET v = v + 1 WHERE k = 1");
    assert_eq!(nodes(&qc), vec![0, 1]);

    let qc = route(&c, &routing, &mut s, "SELECT * FROM t");
    assert_eq!(nodes(&qc), vec![1]);
}

#[test]
fn native_replication_replicate_select() {
    let c = cluster(ClusterMode::NativeReplication, 2);
    let routing = Routing {
        mode: ClusterMode::NativeReplication,
        replicate_select: true,
        ..Default::default()
    };
    let mut s = SessionContext::new(1, 2, 0);
    let qc = route(&c, &routing, &mut s, "SELECT * FROM t");
    assert_eq!(nodes(&qc), vec![0, 1]);
}

#[test]
fn down_primary_falls_back_to_main() {
    let c = cluster(ClusterMode::StreamingReplication, 2);
    c.set_status(0, BackendStatus::Down);
    let routing = Routing::default();
    let mut s = SessionContext::new(1, 2, 1);
    let qc = route(&c, &routing, &mut s, "INSERT INTO t VALUES (1)");
    assert_eq!(nodes(&qc), vec![1]);
}
