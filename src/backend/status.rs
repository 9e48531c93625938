//! Live status of the configured backend slots.
//!
//! The slot array is fixed at startup; only the per-slot status, the primary
//! index, and the replication delay change at runtime, and those are atomics
//! so sessions read them without locking. Transitions are performed by the
//! failover orchestrator, never by sessions.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

use crate::config::{BackendConfig, ClusterMode, Config};
use crate::errors::{BackendIdentifier, Error};

pub const MAX_NUM_BACKENDS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendStatus {
    Unused = 0,
    ConnectWait = 1,
    Up = 2,
    Down = 3,
    Quarantined = 4,
}

impl From<u8> for BackendStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => BackendStatus::ConnectWait,
            2 => BackendStatus::Up,
            3 => BackendStatus::Down,
            4 => BackendStatus::Quarantined,
            _ => BackendStatus::Unused,
        }
    }
}

/// One backend slot: static address plus live status.
pub struct BackendSlot {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub allow_to_failover: bool,
    status: AtomicU8,
    /// Streaming-replication delay in bytes, updated by the health checker.
    standby_delay: AtomicU64,
}

impl BackendSlot {
    fn new(config: &BackendConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            weight: config.weight,
            allow_to_failover: config.allow_to_failover,
            status: AtomicU8::new(BackendStatus::ConnectWait as u8),
            standby_delay: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> BackendStatus {
        self.status.load(Ordering::Acquire).into()
    }

    pub fn identifier(&self, node_id: usize) -> BackendIdentifier {
        BackendIdentifier {
            node_id,
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// The ordered backend array plus the derived main/primary indexes.
pub struct Cluster {
    slots: Vec<BackendSlot>,
    mode: ClusterMode,
    /// Index of the write node in streaming-replication mode; -1 when unset.
    primary: AtomicI64,
}

impl Cluster {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        if config.backends.len() > MAX_NUM_BACKENDS {
            return Err(Error::BadConfig(format!(
                "{} backends configured, maximum is {MAX_NUM_BACKENDS}",
                config.backends.len()
            )));
        }
        let slots: Vec<BackendSlot> = config.backends.iter().map(BackendSlot::new).collect();
        let primary = config
            .backends
            .iter()
            .position(|b| b.primary)
            .map(|i| i as i64)
            .unwrap_or(-1);
        Ok(Self {
            slots,
            mode: config.routing.mode,
            primary: AtomicI64::new(primary),
        })
    }

    pub fn mode(&self) -> ClusterMode {
        self.mode
    }

    pub fn num_backends(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, node_id: usize) -> &BackendSlot {
        &self.slots[node_id]
    }

    pub fn status(&self, node_id: usize) -> BackendStatus {
        self.slots[node_id].status()
    }

    pub fn set_status(&self, node_id: usize, status: BackendStatus) {
        self.slots[node_id]
            .status
            .store(status as u8, Ordering::Release);
    }

    pub fn is_up(&self, node_id: usize) -> bool {
        self.status(node_id) == BackendStatus::Up
    }

    /// The lowest-indexed live node; used where no primary concept applies.
    pub fn main_node_id(&self) -> Option<usize> {
        (0..self.slots.len()).find(|&i| self.is_up(i))
    }

    /// The write node, when one is known and alive.
    pub fn primary_node_id(&self) -> Option<usize> {
        let id = self.primary.load(Ordering::Acquire);
        if id >= 0 && self.is_up(id as usize) {
            Some(id as usize)
        } else {
            None
        }
    }

    pub fn set_primary_node_id(&self, node_id: Option<usize>) {
        self.primary.store(
            node_id.map(|i| i as i64).unwrap_or(-1),
            Ordering::Release,
        );
    }

    /// The node a primary-only statement goes to. Falls back to the main
    /// node when no primary is known.
    pub fn primary_or_main(&self) -> Result<usize, Error> {
        self.primary_node_id()
            .or_else(|| self.main_node_id())
            .ok_or(Error::BackendDown(0))
    }

    pub fn standby_delay(&self, node_id: usize) -> u64 {
        self.slots[node_id].standby_delay.load(Ordering::Acquire)
    }

    pub fn set_standby_delay(&self, node_id: usize, delay: u64) {
        self.slots[node_id]
            .standby_delay
            .store(delay, Ordering::Release);
    }

    /// Weighted pick over live weighted nodes. `roll` makes the pick
    /// deterministic for a given session; callers pass a fresh random for
    /// statement-level balancing.
    pub fn select_load_balance_node(&self, roll: u64) -> usize {
        let candidates: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.is_up(i) && self.slots[i].weight > 0)
            .collect();
        match self.pick_weighted(&candidates, roll) {
            Some(id) => id,
            None => self.primary_or_main().unwrap_or(0),
        }
    }

    fn pick_weighted(&self, candidates: &[usize], roll: u64) -> Option<usize> {
        let total: u64 = candidates.iter().map(|&i| self.slots[i].weight as u64).sum();
        if total == 0 {
            return None;
        }
        let mut point = roll % total;
        for &i in candidates {
            let weight = self.slots[i].weight as u64;
            if point < weight {
                return Some(i);
            }
            point -= weight;
        }
        None
    }

    /// The standby with the smallest replication delay, primary excluded.
    pub fn least_delayed_standby(&self) -> Option<usize> {
        let primary = self.primary.load(Ordering::Acquire);
        (0..self.slots.len())
            .filter(|&i| self.is_up(i) && i as i64 != primary && self.slots[i].weight > 0)
            .min_by_key(|&i| self.standby_delay(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Routing;

    fn cluster(n: usize, primary: Option<usize>) -> Cluster {
        let config = Config {
            backends: (0..n)
                .map(|i| BackendConfig {
                    host: format!("pg{i}"),
                    port: 5432,
                    weight: 1,
                    primary: Some(i) == primary,
                    allow_to_failover: true,
                })
                .collect(),
            routing: Routing {
                mode: ClusterMode::StreamingReplication,
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

    #[test]
    fn main_node_is_lowest_up() {
        let c = cluster(3, Some(0));
        assert_eq!(c.main_node_id(), Some(0));
        c.set_status(0, BackendStatus::Down);
        assert_eq!(c.main_node_id(), Some(1));
    }

    #[test]
    fn primary_falls_back_to_main_when_down() {
        let c = cluster(3, Some(1));
        assert_eq!(c.primary_or_main().unwrap(), 1);
        c.set_status(1, BackendStatus::Down);
        assert_eq!(c.primary_node_id(), None);
        assert_eq!(c.primary_or_main().unwrap(), 0);
    }

    #[test]
    fn all_down_is_backend_down() {
        let c = cluster(2, Some(0));
        c.set_status(0, BackendStatus::Down);
        c.set_status(1, BackendStatus::Quarantined);
        assert!(c.primary_or_main().is_err());
    }

    #[test]
    fn weighted_pick_is_deterministic_per_roll() {
        let c = cluster(3, Some(0));
        let a = c.select_load_balance_node(7);
        let b = c.select_load_balance_node(7);
        assert_eq!(a, b);
        // All nodes reachable over different rolls.
        let picks: std::collections::HashSet<usize> =
            (0..9u64).map(|r| c.select_load_balance_node(r)).collect();
        assert_eq!(picks.len(), 3);
    }

    #[test]
    fn least_delayed_standby_skips_primary() {
        let c = cluster(3, Some(0));
        c.set_standby_delay(1, 500);
        c.set_standby_delay(2, 100);
        assert_eq!(c.least_delayed_standby(), Some(2));
    }
}
