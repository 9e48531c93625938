//! Tests for session-context bookkeeping.

use bytes::BytesMut;

use super::query::{NodeMask, QueryContext};
use super::session::*;
use crate::parser::parse;

fn session() -> SessionContext {
    SessionContext::new(1, 2, 1)
}

fn query_context(text: &str) -> QueryContext {
    QueryContext::new(parse(text).unwrap(), 2)
}

fn pending(kind: PendingKind, handle: Option<crate::context::arena::Handle>) -> PendingMessage {
    PendingMessage {
        kind,
        bytes: BytesMut::new(),
        query_text: String::new(),
        statement_name: None,
        portal_name: None,
        sent_to: NodeMask::empty(),
        query_handle: handle,
        flush_pending: false,
        not_forward_to_frontend: false,
        from_cache: false,
    }
}

#[test]
fn pending_fifo_preserves_order() {
    let mut s = session();
    s.push_pending(pending(PendingKind::Parse, None));
    s.push_pending(pending(PendingKind::Bind, None));
    s.push_pending(pending(PendingKind::Execute, None));
    s.push_pending(pending(PendingKind::Sync, None));

    let kinds: Vec<PendingKind> = std::iter::from_fn(|| s.pop_pending().map(|m| m.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            PendingKind::Parse,
            PendingKind::Bind,
            PendingKind::Execute,
            PendingKind::Sync
        ]
    );
}

#[test]
fn previous_pending_survives_pop() {
    let mut s = session();
    s.push_pending(pending(PendingKind::Parse, None));
    let popped = s.pop_pending().unwrap();
    assert_eq!(popped.kind, PendingKind::Parse);
    assert_eq!(s.previous_pending.as_ref().unwrap().kind, PendingKind::Parse);
}

#[test]
fn query_context_lives_while_referenced() {
    let mut s = session();
    let handle = s.start_query(query_context("SELECT 1"));

    // Referenced by a sent message: survives end of statement.
    s.add_sent_message(SentMessage {
        kind: SentMessageKind::Parse,
        name: "stmt1".into(),
        bytes: BytesMut::new(),
        query_handle: handle,
        state: SentMessageState::Created,
    });
    s.unset_query_in_progress();
    assert!(s.queries.contains(handle));

    // Dropping the sent message reaps the context.
    s.remove_sent_message(SentMessageKind::Parse, "stmt1");
    assert!(!s.queries.contains(handle));
}

#[test]
fn unreferenced_query_context_dies_at_statement_end() {
    let mut s = session();
    let handle = s.start_query(query_context("SELECT 1"));
    assert!(s.queries.contains(handle));
    s.unset_query_in_progress();
    assert!(!s.queries.contains(handle));
}

#[test]
fn deallocate_all_reaps_everything() {
    let mut s = session();
    for name in ["a", "b"] {
        let handle = s.start_query(query_context("SELECT 1"));
        s.add_sent_message(SentMessage {
            kind: SentMessageKind::Parse,
            name: name.into(),
            bytes: BytesMut::new(),
            query_handle: handle,
            state: SentMessageState::Created,
        });
        s.unset_query_in_progress();
    }
    assert!(s.find_prepared("a").is_some());
    s.remove_all_sent_messages();
    assert!(s.find_prepared("a").is_none());
    assert!(s.queries.is_empty());
}

#[test]
fn same_name_reparse_replaces_entry() {
    let mut s = session();
    let h1 = s.start_query(query_context("SELECT 1"));
    s.add_sent_message(SentMessage {
        kind: SentMessageKind::Parse,
        name: "s".into(),
        bytes: BytesMut::new(),
        query_handle: h1,
        state: SentMessageState::Created,
    });
    s.unset_query_in_progress();

    let h2 = s.start_query(query_context("SELECT 2"));
    s.add_sent_message(SentMessage {
        kind: SentMessageKind::Parse,
        name: "s".into(),
        bytes: BytesMut::new(),
        query_handle: h2,
        state: SentMessageState::Created,
    });
    s.unset_query_in_progress();

    assert!(!s.queries.contains(h1));
    assert!(s.queries.contains(h2));
    assert_eq!(s.find_prepared("s").unwrap().query_handle, h2);
}

#[test]
fn temp_table_lifecycle() {
    let mut s = session();
    s.temp_table_creating("scratch");
    assert!(s.has_temp_table("scratch"));

    // Rollback discards the tentative creation.
    s.transaction_ended(false);
    assert!(!s.has_temp_table("scratch"));

    // Commit settles it.
    s.temp_table_creating("scratch");
    s.transaction_ended(true);
    assert!(s.has_temp_table("scratch"));

    // A tentative drop still counts as existing until committed.
    s.temp_table_dropping("scratch");
    assert!(s.has_temp_table("scratch"));
    s.transaction_ended(true);
    assert!(!s.has_temp_table("scratch"));

    // A rolled-back drop leaves the committed creation in place.
    s.temp_table_creating("scratch");
    s.transaction_ended(true);
    s.temp_table_dropping("scratch");
    s.transaction_ended(false);
    assert!(s.has_temp_table("scratch"));
}

#[test]
fn writing_transaction_latches() {
    let mut s = session();
    assert!(!s.is_writing_transaction());
    s.set_writing_transaction();
    assert!(s.is_writing_transaction());
    s.transaction_ended(true);
    assert!(!s.is_writing_transaction());
    // The session-lifetime latch stays.
    assert!(s.ever_wrote_in_transaction());
}

#[test]
fn dml_objects_reset_at_transaction_end() {
    let mut s = session();
    s.note_dml_object("public.t".into());
    assert!(s.wrote_object("public.t"));
    s.transaction_ended(true);
    assert!(!s.wrote_object("public.t"));
}
