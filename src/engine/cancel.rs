//! Query cancellation.
//!
//! The pooler hands every client its own BackendKeyData pair; a
//! CancelRequest arriving on a fresh connection is matched against that
//! pair and fanned out to every live backend of the session it names.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::backend::connection::BackendConnection;

/// One backend to forward a cancel to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelTarget {
    pub host: String,
    pub port: u16,
    pub pid: i32,
    pub secret_key: i32,
}

/// Pooler-issued (process_id, secret_key) → that session's backends.
#[derive(Default)]
pub struct CancelMap {
    entries: Mutex<HashMap<(i32, i32), Vec<CancelTarget>>>,
}

impl CancelMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, process_id: i32, secret_key: i32, targets: Vec<CancelTarget>) {
        self.entries
            .lock()
            .insert((process_id, secret_key), targets);
    }

    pub fn unregister(&self, process_id: i32, secret_key: i32) {
        self.entries.lock().remove(&(process_id, secret_key));
    }

    pub fn lookup(&self, process_id: i32, secret_key: i32) -> Option<Vec<CancelTarget>> {
        self.entries.lock().get(&(process_id, secret_key)).cloned()
    }

    /// Forward a CancelRequest to every backend of the named session. Both
    /// key halves must match; an unknown pair is silently dropped, exactly
    /// like a real server.
    pub async fn cancel(&self, process_id: i32, secret_key: i32) {
        let targets = match self.lookup(process_id, secret_key) {
            Some(targets) => targets,
            None => {
                debug!("cancel request for unknown session {process_id}");
                return;
            }
        };
        for target in targets {
            BackendConnection::send_cancel(
                &target.host,
                target.port,
                target.pid,
                target.secret_key,
            )
            .await;
        }
    }
}
