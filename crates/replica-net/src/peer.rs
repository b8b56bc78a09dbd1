//! Peer identity, information and health

use rand::Rng;
use replica_core::Eid;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Peers are identified by their node id
pub type PeerId = Eid;

/// Information about a peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Dialable addresses
    pub addrs: Vec<SocketAddr>,
    /// Last seen timestamp (unix millis)
    pub last_seen: u64,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<SocketAddr>) -> Self {
        Self {
            id,
            addrs,
            last_seen: 0,
        }
    }

    /// Update last seen time
    pub fn touch(&mut self) {
        use std::time::{SystemTime, UNIX_EPOCH};
        self.last_seen = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
    }
}

/// Strike and reconnect bookkeeping for one peer
#[derive(Clone, Debug)]
pub struct PeerHealth {
    strikes: u32,
    failures: u32,
    strike_limit: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl PeerHealth {
    pub fn new(strike_limit: u32, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            strikes: 0,
            failures: 0,
            strike_limit,
            backoff_base,
            backoff_cap,
        }
    }

    /// Credit the peer with a bad oplog. Returns true once it should be dropped.
    pub fn strike(&mut self) -> bool {
        self.strikes += 1;
        self.strikes >= self.strike_limit
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    /// Record a failed dial or broken session, returning the delay before the next try
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.backoff();
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// `base * 2^failures`, capped
    pub fn backoff(&self) -> Duration {
        let factor = 1u32.checked_shl(self.failures.min(31)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }

    /// Backoff with up to 10% jitter added
    pub fn backoff_with_jitter(&self) -> Duration {
        let base = self.backoff();
        let jitter_ms = (base.as_millis() as u64 / 10).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}
