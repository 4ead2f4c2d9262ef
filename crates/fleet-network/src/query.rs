//! Query manager -- correlation id → waiter for request/response packets.
//!
//! Every entry is removed exactly once: by the matching response, by the
//! waiter giving up (timeout or drop), or by the channel closing.

use std::collections::HashMap;

use fleet_protocol::Packet;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Default)]
pub struct QueryManager {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Packet>>>,
}

impl QueryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `correlation`.
    pub fn register(&self, correlation: Uuid) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        pending.insert(correlation, tx);
        tracing::trace!(%correlation, pending = pending.len(), "registered query waiter");
        rx
    }

    /// Hand a response to its waiter. Gives the packet back when nobody waits.
    pub fn complete(&self, packet: Packet) -> Result<(), Packet> {
        let waiter = self.pending.lock().remove(&packet.correlation());
        match waiter {
            // The receiver may have been dropped between removal and send.
            Some(tx) => tx.send(packet),
            None => Err(packet),
        }
    }

    /// Drop the waiter for `correlation`. Returns whether it was still pending.
    pub fn cancel(&self, correlation: &Uuid) -> bool {
        self.pending.lock().remove(correlation).is_some()
    }

    /// Fail every outstanding waiter.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        drained.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Removes its waiter when dropped, so a cancelled or timed-out query never
/// leaves a stale correlation entry behind.
pub(crate) struct PendingQuery<'a> {
    manager: &'a QueryManager,
    correlation: Uuid,
}

impl<'a> PendingQuery<'a> {
    pub(crate) fn new(manager: &'a QueryManager, correlation: Uuid) -> Self {
        Self {
            manager,
            correlation,
        }
    }
}

impl Drop for PendingQuery<'_> {
    fn drop(&mut self) {
        self.manager.cancel(&self.correlation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(correlation: Uuid) -> Packet {
        Packet::new("t", 1, Vec::new()).with_correlation(correlation)
    }

    #[tokio::test]
    async fn test_complete_delivers_to_waiter() {
        let manager = QueryManager::new();
        let id = Uuid::new_v4();
        let rx = manager.register(id);

        assert!(manager.complete(response(id)).is_ok());
        assert_eq!(rx.await.unwrap().correlation(), id);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_unknown_correlation_returned() {
        let manager = QueryManager::new();
        let _rx = manager.register(Uuid::new_v4());
        let stray = response(Uuid::new_v4());
        assert!(manager.complete(stray).is_err());
        assert_eq!(manager.pending_count(), 1);
    }

    #[test]
    fn test_entry_removed_exactly_once() {
        let manager = QueryManager::new();
        let id = Uuid::new_v4();
        let _rx = manager.register(id);

        assert!(manager.cancel(&id));
        assert!(!manager.cancel(&id));
        // A late response finds nothing.
        assert!(manager.complete(response(id)).is_err());
    }

    #[tokio::test]
    async fn test_close_all_fails_waiters() {
        let manager = QueryManager::new();
        let a = manager.register(Uuid::new_v4());
        let b = manager.register(Uuid::new_v4());
        assert_eq!(manager.close_all(), 2);
        assert!(a.await.is_err());
        assert!(b.await.is_err());
    }

    #[test]
    fn test_pending_guard_cancels_on_drop() {
        let manager = QueryManager::new();
        let id = Uuid::new_v4();
        let _rx = manager.register(id);
        {
            let _guard = PendingQuery::new(&manager, id);
        }
        assert_eq!(manager.pending_count(), 0);
    }
}
