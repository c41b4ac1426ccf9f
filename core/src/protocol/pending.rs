// Pending request table: correlates outgoing requests with their responses

use libp2p::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// An outstanding request awaiting its response
#[derive(Debug, Clone)]
pub struct PendingEntry<R> {
    pub request: R,
    pub peer: PeerId,
    pub created_at: Instant,
}

/// In-flight requests keyed by message id.
///
/// The lock is held only for a single insert, lookup or removal, never
/// across network I/O.
#[derive(Debug)]
pub struct PendingRequests<R> {
    entries: Mutex<HashMap<String, PendingEntry<R>>>,
}

impl<R> Default for PendingRequests<R> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<R> PendingRequests<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, message_id: impl Into<String>, peer: PeerId, request: R) {
        self.insert_at(message_id, peer, request, Instant::now());
    }

    pub fn insert_at(
        &self,
        message_id: impl Into<String>,
        peer: PeerId,
        request: R,
        created_at: Instant,
    ) {
        self.entries.lock().insert(
            message_id.into(),
            PendingEntry {
                request,
                peer,
                created_at,
            },
        );
    }

    /// Take the entry for `message_id`; a second call for the same id yields `None`
    pub fn remove(&self, message_id: &str) -> Option<PendingEntry<R>> {
        self.entries.lock().remove(message_id)
    }

    /// Take the entry for `message_id` only if it was sent to `peer`;
    /// an entry for another peer stays pending
    pub fn remove_from(&self, message_id: &str, peer: &PeerId) -> Option<PendingEntry<R>> {
        let mut entries = self.entries.lock();
        match entries.get(message_id) {
            Some(entry) if entry.peer == *peer => entries.remove(message_id),
            _ => None,
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.lock().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove and return every entry older than `timeout` at `now`
    pub fn evict_expired(&self, timeout: Duration, now: Instant) -> Vec<(String, PendingEntry<R>)> {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.created_at) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_exactly_once() {
        let pending = PendingRequests::new();
        let peer = PeerId::random();
        pending.insert("A1", peer, "hello");

        let entry = pending.remove("A1").unwrap();
        assert_eq!(entry.request, "hello");
        assert_eq!(entry.peer, peer);
        assert!(pending.remove("A1").is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_remove_leaves_other_entries() {
        let pending = PendingRequests::new();
        let peer = PeerId::random();
        pending.insert("A1", peer, 1);
        pending.insert("A2", peer, 2);
        pending.insert("A3", peer, 3);

        assert_eq!(pending.remove("A2").map(|e| e.request), Some(2));
        assert!(pending.contains("A1"));
        assert!(pending.contains("A3"));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_remove_from_other_peer_keeps_entry() {
        let pending = PendingRequests::new();
        let peer = PeerId::random();
        pending.insert("A1", peer, "hello");

        assert!(pending.remove_from("A1", &PeerId::random()).is_none());
        assert!(pending.contains("A1"));
        assert_eq!(pending.remove_from("A1", &peer).map(|e| e.request), Some("hello"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unknown_id_does_not_change_table() {
        let pending = PendingRequests::new();
        pending.insert("A1", PeerId::random(), ());
        assert!(pending.remove("nope").is_none());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_evict_expired() {
        let pending = PendingRequests::new();
        let peer = PeerId::random();
        let start = Instant::now();
        pending.insert_at("old", peer, (), start);
        pending.insert_at("new", peer, (), start + Duration::from_secs(50));

        let evicted = pending.evict_expired(Duration::from_secs(60), start + Duration::from_secs(61));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "old");
        assert!(pending.contains("new"));

        let none = pending.evict_expired(Duration::from_secs(60), start + Duration::from_secs(61));
        assert!(none.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_and_removes() {
        let pending = std::sync::Arc::new(PendingRequests::new());
        let peer = PeerId::random();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pending = pending.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        pending.insert(format!("{t}-{i}"), peer, i);
                    }
                    for i in (0..100).step_by(2) {
                        assert!(pending.remove(&format!("{t}-{i}")).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pending.len(), 8 * 50);
    }
}
