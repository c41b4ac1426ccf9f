// Dial backoff: remembers peers whose dials recently failed
//
// A peer that failed to dial is not dialed again until its backoff window
// has passed. The relay path clears the entry before dialing through a
// circuit, since a failed direct dial says nothing about the circuit.

use libp2p::PeerId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const BACKOFF_BASE: Duration = Duration::from_secs(5);
pub const BACKOFF_COEFFICIENT: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
    attempts: u32,
    until: Instant,
}

#[derive(Debug, Default)]
pub struct DialBackoff {
    entries: HashMap<PeerId, BackoffEntry>,
}

impl DialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backoff window after `attempts` consecutive failures
    pub fn delay_for(attempts: u32) -> Duration {
        let squared = attempts.saturating_mul(attempts);
        BACKOFF_BASE
            .saturating_add(BACKOFF_COEFFICIENT.saturating_mul(squared))
            .min(BACKOFF_MAX)
    }

    /// Record a failed dial at `now`
    pub fn record_failure(&mut self, peer: PeerId, now: Instant) {
        let attempts = self
            .entries
            .get(&peer)
            .map(|e| e.attempts.saturating_add(1))
            .unwrap_or(1);
        let until = now + Self::delay_for(attempts);
        self.entries.insert(peer, BackoffEntry { attempts, until });
    }

    pub fn is_backed_off(&self, peer: &PeerId, now: Instant) -> bool {
        self.entries
            .get(peer)
            .map(|e| now < e.until)
            .unwrap_or(false)
    }

    pub fn clear(&mut self, peer: &PeerId) {
        self.entries.remove(peer);
    }

    /// Drop entries whose window has passed
    pub fn prune(&mut self, now: Instant) {
        self.entries.retain(|_, e| now < e.until);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
