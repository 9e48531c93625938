//! Per-client session state.

use ahash::{AHashMap, AHashSet};
use bytes::BytesMut;
use std::collections::VecDeque;

use crate::context::arena::{Arena, Handle};
use crate::context::query::QueryContext;
use crate::parser::ast::IsolationLevel;

/// How a named statement or portal came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentMessageKind {
    /// PREPARE issued as SQL ('Q').
    Query,
    /// Extended-protocol Parse ('P').
    Parse,
    /// Extended-protocol Bind, i.e. a portal ('B').
    Portal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentMessageState {
    Created,
    Closed,
}

/// A named Parse or Bind retained across statements until closed.
pub struct SentMessage {
    pub kind: SentMessageKind,
    pub name: String,
    /// The original message bytes, replayed when a backend needs the
    /// statement re-issued.
    pub bytes: BytesMut,
    pub query_handle: Handle,
    pub state: SentMessageState,
}

/// Extended-protocol message kinds tracked in the pending FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Parse,
    Bind,
    Execute,
    Describe,
    Close,
    Sync,
    Flush,
}

impl PendingKind {
    pub fn from_wire(kind: u8) -> Option<Self> {
        match kind {
            b'P' => Some(PendingKind::Parse),
            b'B' => Some(PendingKind::Bind),
            b'E' => Some(PendingKind::Execute),
            b'D' => Some(PendingKind::Describe),
            b'C' => Some(PendingKind::Close),
            b'S' => Some(PendingKind::Sync),
            b'H' => Some(PendingKind::Flush),
            _ => None,
        }
    }
}

/// One message whose backend response has not been fully consumed yet.
#[derive(Clone)]
pub struct PendingMessage {
    pub kind: PendingKind,
    pub bytes: BytesMut,
    /// Original query text, for error context.
    pub query_text: String,
    pub statement_name: Option<String>,
    pub portal_name: Option<String>,
    /// Which backends this message actually went to.
    pub sent_to: crate::context::query::NodeMask,
    pub query_handle: Option<Handle>,
    /// An internal Flush follows, so a response is due before Sync.
    pub flush_pending: bool,
    /// Response is consumed without forwarding (internally re-issued Parse).
    pub not_forward_to_frontend: bool,
    /// Responses were injected from the result cache, not a backend.
    pub from_cache: bool,
}

/// Temp-table bookkeeping: tentative inside a transaction, settled at
/// COMMIT, discarded at ROLLBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempTableState {
    Creating,
    Dropping,
    CreateCommitted,
    DropCommitted,
}

pub struct SessionContext {
    pub id: u64,
    pub num_backends: usize,

    pub queries: Arena<QueryContext>,
    /// The one statement currently being processed, if any.
    in_progress: Option<Handle>,

    sent_messages: Vec<SentMessage>,
    pending: VecDeque<PendingMessage>,
    /// Shallow copy of the last consumed pending message, kept across one
    /// ReadyForQuery boundary for error context.
    pub previous_pending: Option<PendingMessage>,

    temp_tables: AHashMap<String, TempTableState>,

    /// Latched on the first write inside a transaction.
    writing_transaction: bool,
    /// Stays latched for the rest of the session (trans_transaction policy).
    ever_wrote_in_transaction: bool,
    /// The primary reported an error inside this transaction.
    pub failed_transaction: bool,
    /// Transaction status per backend as reported by ReadyForQuery.
    tx_state: Vec<u8>,
    /// Lazily resolved with SHOW transaction_isolation on the primary.
    pub transaction_isolation: Option<IsolationLevel>,

    /// Load-balance target chosen at session start; re-chosen per statement
    /// when statement-level balancing is on.
    pub load_balance_node_id: usize,

    /// Objects written in the current transaction (dml-adaptive routing).
    dml_objects: AHashSet<String>,
}

impl SessionContext {
    pub fn new(id: u64, num_backends: usize, load_balance_node_id: usize) -> Self {
        Self {
            id,
            num_backends,
            queries: Arena::new(),
            in_progress: None,
            sent_messages: Vec::new(),
            pending: VecDeque::new(),
            previous_pending: None,
            temp_tables: AHashMap::new(),
            writing_transaction: false,
            ever_wrote_in_transaction: false,
            failed_transaction: false,
            tx_state: vec![b'I'; num_backends],
            transaction_isolation: None,
            load_balance_node_id,
            dml_objects: AHashSet::new(),
        }
    }

    // --- query context lifecycle ---

    pub fn start_query(&mut self, context: QueryContext) -> Handle {
        let handle = self.queries.insert(context);
        self.in_progress = Some(handle);
        handle
    }

    pub fn in_progress(&self) -> Option<Handle> {
        self.in_progress
    }

    /// Re-enter an existing context (Bind/Describe/Execute of a retained
    /// statement or portal).
    pub fn set_query_in_progress(&mut self, handle: Handle) {
        if self.in_progress != Some(handle) {
            self.unset_query_in_progress();
            self.in_progress = Some(handle);
        }
    }

    pub fn current_query(&self) -> Option<&QueryContext> {
        self.queries.get(self.in_progress?)
    }

    pub fn current_query_mut(&mut self) -> Option<&mut QueryContext> {
        self.queries.get_mut(self.in_progress?)
    }

    /// Mark the statement finished and reap its context unless a sent or
    /// pending message still needs it.
    pub fn unset_query_in_progress(&mut self) {
        if let Some(handle) = self.in_progress.take() {
            self.release_query_context(handle);
        }
    }

    /// Destroy a query context once nothing references it.
    pub fn release_query_context(&mut self, handle: Handle) {
        if self.in_progress == Some(handle) {
            return;
        }
        let referenced = self
            .sent_messages
            .iter()
            .any(|m| m.query_handle == handle && m.state == SentMessageState::Created)
            || self.pending.iter().any(|m| m.query_handle == Some(handle))
            || self
                .previous_pending
                .as_ref()
                .is_some_and(|m| m.query_handle == Some(handle));
        if !referenced {
            self.queries.remove(handle);
        }
    }

    // --- sent messages ---

    /// Register a named Parse/Bind/PREPARE. A live entry under the same
    /// (kind, name) is replaced; the unnamed entry is implicitly overwritten.
    pub fn add_sent_message(&mut self, message: SentMessage) {
        if let Some(pos) = self
            .sent_messages
            .iter()
            .position(|m| m.kind == message.kind && m.name == message.name)
        {
            let old = self.sent_messages.remove(pos);
            self.release_query_context(old.query_handle);
        }
        self.sent_messages.push(message);
    }

    pub fn get_sent_message(&self, kind: SentMessageKind, name: &str) -> Option<&SentMessage> {
        self.sent_messages
            .iter()
            .find(|m| m.kind == kind && m.name == name && m.state == SentMessageState::Created)
    }

    /// Look up a prepared statement by name, PREPARE-via-SQL first the way
    /// EXECUTE resolution does.
    pub fn find_prepared(&self, name: &str) -> Option<&SentMessage> {
        self.get_sent_message(SentMessageKind::Query, name)
            .or_else(|| self.get_sent_message(SentMessageKind::Parse, name))
    }

    pub fn remove_sent_message(&mut self, kind: SentMessageKind, name: &str) {
        if let Some(pos) = self
            .sent_messages
            .iter()
            .position(|m| m.kind == kind && m.name == name)
        {
            let old = self.sent_messages.remove(pos);
            self.release_query_context(old.query_handle);
        }
    }

    /// DEALLOCATE ALL.
    pub fn remove_all_sent_messages(&mut self) {
        let old = std::mem::take(&mut self.sent_messages);
        for message in old {
            self.release_query_context(message.query_handle);
        }
    }

    // --- pending FIFO ---

    pub fn push_pending(&mut self, message: PendingMessage) {
        self.pending.push_back(message);
    }

    pub fn pop_pending(&mut self) -> Option<PendingMessage> {
        let message = self.pending.pop_front();
        if let Some(message) = &message {
            self.previous_pending = Some(message.clone());
        }
        message
    }

    pub fn head_pending(&self) -> Option<&PendingMessage> {
        self.pending.front()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Reset at ReadyForQuery; contexts referenced only by the queue die.
    pub fn reset_pending(&mut self) {
        let drained: Vec<PendingMessage> = self.pending.drain(..).collect();
        for message in drained {
            if let Some(handle) = message.query_handle {
                self.release_query_context(handle);
            }
        }
    }

    // --- transaction state ---

    pub fn tx_state(&self, node_id: usize) -> u8 {
        self.tx_state[node_id]
    }

    pub fn set_tx_state(&mut self, node_id: usize, state: u8) {
        self.tx_state[node_id] = state;
    }

    /// In a transaction as far as the given node's last ReadyForQuery says.
    pub fn in_transaction_on(&self, node_id: usize) -> bool {
        self.tx_state[node_id] != b'I'
    }

    pub fn is_writing_transaction(&self) -> bool {
        self.writing_transaction
    }

    pub fn ever_wrote_in_transaction(&self) -> bool {
        self.ever_wrote_in_transaction
    }

    pub fn set_writing_transaction(&mut self) {
        self.writing_transaction = true;
        self.ever_wrote_in_transaction = true;
    }

    /// COMMIT/ROLLBACK observed: clear the per-transaction latches and
    /// settle temp-table state.
    pub fn transaction_ended(&mut self, committed: bool) {
        self.writing_transaction = false;
        self.failed_transaction = false;
        self.transaction_isolation = None;
        self.dml_objects.clear();
        if committed {
            self.commit_temp_tables();
        } else {
            self.rollback_temp_tables();
        }
    }

    // --- temp tables ---

    pub fn temp_table_creating(&mut self, name: &str) {
        self.temp_tables
            .insert(name.to_string(), TempTableState::Creating);
    }

    pub fn temp_table_dropping(&mut self, name: &str) {
        if self.temp_tables.contains_key(name) {
            self.temp_tables
                .insert(name.to_string(), TempTableState::Dropping);
        }
    }

    fn commit_temp_tables(&mut self) {
        let mut dropped = Vec::new();
        for (name, state) in self.temp_tables.iter_mut() {
            match *state {
                TempTableState::Creating => *state = TempTableState::CreateCommitted,
                TempTableState::Dropping => {
                    *state = TempTableState::DropCommitted;
                    dropped.push(name.clone());
                }
                _ => {}
            }
        }
        for name in dropped {
            self.temp_tables.remove(&name);
        }
    }

    fn rollback_temp_tables(&mut self) {
        // Creations made in the transaction vanish; a rolled-back drop
        // leaves the table in place.
        self.temp_tables
            .retain(|_, state| !matches!(state, TempTableState::Creating));
        for state in self.temp_tables.values_mut() {
            if *state == TempTableState::Dropping {
                *state = TempTableState::CreateCommitted;
            }
        }
    }

    /// Tentative states count both ways: a table being created inside the
    /// transaction is already temp, a table being dropped still exists
    /// until the drop commits.
    pub fn has_temp_table(&self, name: &str) -> bool {
        matches!(
            self.temp_tables.get(name),
            Some(TempTableState::Creating)
                | Some(TempTableState::CreateCommitted)
                | Some(TempTableState::Dropping)
        )
    }

    // --- dml-adaptive tracking ---

    pub fn note_dml_object(&mut self, qualified_name: String) {
        self.dml_objects.insert(qualified_name);
    }

    pub fn wrote_object(&self, qualified_name: &str) -> bool {
        self.dml_objects.contains(qualified_name)
    }
}
