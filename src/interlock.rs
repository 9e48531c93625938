//! Failover and online-recovery interlock.
//!
//! The failover orchestrator lives outside this crate; sessions only honor
//! two signals from it. `failover_in_progress` aborts any statement that
//! arrives while set. The recovery stage-2 gate stops new statements and
//! lets the orchestrator wait until every session has drained.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::errors::Error;

#[derive(Default)]
pub struct Interlock {
    failover_in_progress: AtomicBool,
    recovery_stage2: AtomicBool,
    conn_counter: AtomicUsize,
    changed: Notify,
}

impl Interlock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failover_in_progress(&self, value: bool) {
        self.failover_in_progress.store(value, Ordering::Release);
        self.changed.notify_waiters();
    }

    pub fn failover_in_progress(&self) -> bool {
        self.failover_in_progress.load(Ordering::Acquire)
    }

    pub fn set_recovery_stage2(&self, value: bool) {
        self.recovery_stage2.store(value, Ordering::Release);
        self.changed.notify_waiters();
    }

    /// Gate called before every statement. Fails the session during
    /// failover; parks it while recovery stage 2 holds the cluster quiet.
    pub async fn begin_statement(&self) -> Result<(), Error> {
        loop {
            if self.failover_in_progress() {
                return Err(Error::InternalFailover);
            }
            if !self.recovery_stage2.load(Ordering::Acquire) {
                return Ok(());
            }
            // Re-check after the next state change; notified() is armed
            // before the re-read so a flip is never missed.
            let notified = self.changed.notified();
            if !self.recovery_stage2.load(Ordering::Acquire) {
                continue;
            }
            notified.await;
        }
    }

    /// Track one client session for the recovery idle barrier.
    pub fn register_session(self: &Arc<Self>) -> SessionGuard {
        self.conn_counter.fetch_add(1, Ordering::AcqRel);
        SessionGuard {
            interlock: self.clone(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.conn_counter.load(Ordering::Acquire)
    }

    /// Used by the recovery orchestrator: resolves once no session remains.
    pub async fn wait_for_idle(&self) {
        loop {
            if self.connection_count() == 0 {
                return;
            }
            let notified = self.changed.notified();
            if self.connection_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct SessionGuard {
    interlock: Arc<Interlock>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.interlock.conn_counter.fetch_sub(1, Ordering::AcqRel);
        self.interlock.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failover_aborts_statements() {
        let interlock = Interlock::new();
        assert!(interlock.begin_statement().await.is_ok());
        interlock.set_failover_in_progress(true);
        assert_eq!(
            interlock.begin_statement().await,
            Err(Error::InternalFailover)
        );
    }

    #[tokio::test]
    async fn recovery_gate_parks_until_cleared() {
        let interlock = Interlock::new();
        interlock.set_recovery_stage2(true);

        let gate = interlock.clone();
        let waiter = tokio::spawn(async move { gate.begin_statement().await });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        interlock.set_recovery_stage2(false);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn idle_barrier_waits_for_last_session() {
        let interlock = Interlock::new();
        let guard = interlock.register_session();
        assert_eq!(interlock.connection_count(), 1);

        let barrier = interlock.clone();
        let waiter = tokio::spawn(async move { barrier.wait_for_idle().await });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(interlock.connection_count(), 0);
    }
}
