//! Per-statement context.

use std::cmp::Ordering;

use crate::cache::temp::TempQueryCache;
use crate::parser::ParsedQuery;

/// Extended-query progress of one statement on one backend. Total-ordered;
/// a backend's state only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackendStmtState {
    Unparsed = 0,
    ParseComplete = 1,
    BindComplete = 2,
    ExecuteComplete = 3,
}

/// Three-way comparison used when deciding whether a completion message
/// must be forwarded to the client or swallowed.
pub fn state_cmp(a: BackendStmtState, b: BackendStmtState) -> i32 {
    match a.cmp(&b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

/// A set of backend slots, one bit per configured backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeMask {
    bits: u128,
}

impl NodeMask {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&mut self, node_id: usize) {
        self.bits |= 1u128 << node_id;
    }

    pub fn unset(&mut self, node_id: usize) {
        self.bits &= !(1u128 << node_id);
    }

    pub fn contains(&self, node_id: usize) -> bool {
        self.bits & (1u128 << node_id) != 0
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }

    pub fn set_all(&mut self, num_backends: usize) {
        self.bits = if num_backends >= 128 {
            u128::MAX
        } else {
            (1u128 << num_backends) - 1
        };
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Index of the lowest set bit.
    pub fn first(&self) -> Option<usize> {
        if self.bits == 0 {
            None
        } else {
            Some(self.bits.trailing_zeros() as usize)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..128).filter(move |&i| self.contains(i))
    }
}

impl FromIterator<usize> for NodeMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = NodeMask::empty();
        for id in iter {
            mask.set(id);
        }
        mask
    }
}

/// Per-statement state. Immutable after routing except for the per-backend
/// extended-query states, which only advance.
pub struct QueryContext {
    pub query: ParsedQuery,
    /// Standby text for the BEGIN rewrite cases; `None` means send the
    /// original everywhere.
    pub rewritten_query: Option<String>,
    pub where_to_send: NodeMask,
    state_per_backend: Vec<BackendStmtState>,
    /// First set bit of `where_to_send`.
    pub virtual_main_node_id: Option<usize>,
    pub load_balance_node_id: Option<usize>,
    pub is_cache_safe: bool,
    /// Accumulates backend responses while a cache-safe SELECT runs.
    pub temp_cache: Option<TempQueryCache>,
}

impl QueryContext {
    pub fn new(query: ParsedQuery, num_backends: usize) -> Self {
        Self {
            query,
            rewritten_query: None,
            where_to_send: NodeMask::empty(),
            state_per_backend: vec![BackendStmtState::Unparsed; num_backends],
            virtual_main_node_id: None,
            load_balance_node_id: None,
            is_cache_safe: false,
            temp_cache: None,
        }
    }

    pub fn num_backends(&self) -> usize {
        self.state_per_backend.len()
    }

    pub fn set_node(&mut self, node_id: usize) {
        self.where_to_send.set(node_id);
    }

    pub fn set_all_nodes(&mut self) {
        let n = self.num_backends();
        self.where_to_send.set_all(n);
    }

    pub fn clear_nodes(&mut self) {
        self.where_to_send.clear();
    }

    pub fn is_sent_to(&self, node_id: usize) -> bool {
        self.where_to_send.contains(node_id)
    }

    /// Fix `virtual_main_node_id` to the first selected backend.
    pub fn update_virtual_main_node(&mut self) {
        self.virtual_main_node_id = self.where_to_send.first();
    }

    pub fn backend_state(&self, node_id: usize) -> BackendStmtState {
        self.state_per_backend[node_id]
    }

    /// Advance one backend's statement state. Going backwards is a logic
    /// error; the state is left untouched and `false` returned so callers
    /// can decide to swallow the duplicate completion instead.
    pub fn advance_backend_state(&mut self, node_id: usize, next: BackendStmtState) -> bool {
        if state_cmp(self.state_per_backend[node_id], next) > 0 {
            return false;
        }
        self.state_per_backend[node_id] = next;
        true
    }

    /// The text a given backend receives, honoring the standby rewrite.
    pub fn text_for_node(&self, node_id: usize, primary_node_id: Option<usize>) -> &str {
        match (&self.rewritten_query, primary_node_id) {
            (Some(rewritten), Some(primary)) if node_id != primary => rewritten,
            (Some(rewritten), None) => rewritten,
            _ => &self.query.text,
        }
    }
}
