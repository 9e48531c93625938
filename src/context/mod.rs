//! Session- and statement-scoped state.

pub mod arena;
pub mod query;
pub mod session;

pub use arena::{Arena, Handle};
pub use query::{state_cmp, BackendStmtState, NodeMask, QueryContext};
pub use session::{
    PendingKind, PendingMessage, SentMessage, SentMessageKind, SentMessageState, SessionContext,
    TempTableState,
};

#[cfg(test)]
mod tests;
