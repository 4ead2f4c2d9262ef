//! Fleet Sync -- cluster data synchronization.
//!
//! Each replicated domain (tasks, groups, permissions, ...) registers a
//! `SyncDataHandler`. Preparing cluster data for a receiver asks every
//! handler, in (priority, key) order, for its serialized state; applying
//! walks the payload in order and hands each chunk to the handler with the
//! same key.
//!
//!   - force: every domain is serialized in full and appliers overwrite.
//!   - non-force: domains unchanged since the last prepare for the same
//!     receiver are left out, and appliers keep an entry only if the incoming
//!     revision is newer than the local one.
//!
//! Appliers are idempotent: applying the same payload twice leaves the same
//! state as applying it once.

use std::sync::Arc;

use fleet_protocol::{ClusterDataChunk, ClusterDataPayload};
use parking_lot::RwLock;

pub mod store;

pub use store::{Versioned, VersionedStore};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("domain {key}: {reason}")]
    Rejected { key: String, reason: String },
}

/// One replicated domain.
pub trait SyncDataHandler: Send + Sync {
    fn key(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// Serialized domain state for `receiver`. For a non-forced prepare
    /// `None` means nothing changed since the previous prepare for that
    /// receiver.
    fn prepare(&self, receiver: &str, force: bool) -> Result<Option<Vec<u8>>, SyncError>;

    fn apply(&self, data: &[u8], force: bool) -> Result<(), SyncError>;
}

/// Counts from applying one payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub applied: usize,
    /// Chunks with no registered handler.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone, Default)]
pub struct DataSyncRegistry {
    handlers: Arc<RwLock<Vec<Arc<dyn SyncDataHandler>>>>,
}

impl DataSyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. A handler with the same key is replaced.
    pub fn register(&self, handler: Arc<dyn SyncDataHandler>) {
        let mut handlers = self.handlers.write();
        handlers.retain(|h| h.key() != handler.key());
        handlers.push(handler);
        handlers.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.key().cmp(b.key()))
        });
    }

    pub fn unregister(&self, key: &str) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.key() != key);
        handlers.len() != before
    }

    /// Registered keys in application order.
    pub fn keys(&self) -> Vec<String> {
        self.handlers
            .read()
            .iter()
            .map(|h| h.key().to_string())
            .collect()
    }

    pub fn prepare_cluster_data(&self, receiver: &str, force: bool) -> ClusterDataPayload {
        let handlers = self.handlers.read().clone();
        let mut chunks = Vec::with_capacity(handlers.len());
        for handler in &handlers {
            match handler.prepare(receiver, force) {
                Ok(Some(data)) => chunks.push(ClusterDataChunk {
                    key: handler.key().to_string(),
                    data,
                }),
                Ok(None) => {
                    tracing::trace!(key = handler.key(), "domain unchanged, not included");
                }
                Err(e) => {
                    tracing::warn!(key = handler.key(), "failed to prepare sync data: {e}");
                }
            }
        }
        tracing::debug!(receiver, force, domains = chunks.len(), "prepared cluster data");
        ClusterDataPayload { force, chunks }
    }

    pub fn apply_cluster_data(&self, payload: &ClusterDataPayload) -> SyncReport {
        let handlers = self.handlers.read().clone();
        let mut report = SyncReport::default();

        // Payload order is the producer's handler order.
        for chunk in &payload.chunks {
            let Some(handler) = handlers.iter().find(|h| h.key() == chunk.key) else {
                report.skipped += 1;
                tracing::debug!(key = %chunk.key, "no handler for sync data, skipped");
                continue;
            };
            match handler.apply(&chunk.data, payload.force) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(key = %chunk.key, "failed to apply sync data: {e}");
                }
            }
        }

        tracing::debug!(
            force = payload.force,
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed,
            "applied cluster data"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every apply call into a shared log.
    struct Recording {
        key: &'static str,
        priority: i32,
        data: Vec<u8>,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl SyncDataHandler for Recording {
        fn key(&self) -> &str {
            self.key
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn prepare(&self, _receiver: &str, _force: bool) -> Result<Option<Vec<u8>>, SyncError> {
            if self.fail {
                return Err(SyncError::Rejected {
                    key: self.key.into(),
                    reason: "broken".into(),
                });
            }
            Ok(Some(self.data.clone()))
        }

        fn apply(&self, data: &[u8], _force: bool) -> Result<(), SyncError> {
            if self.fail {
                return Err(SyncError::Rejected {
                    key: self.key.into(),
                    reason: "broken".into(),
                });
            }
            self.log
                .lock()
                .push(format!("{}:{}", self.key, String::from_utf8_lossy(data)));
            Ok(())
        }
    }

    fn recording(
        key: &'static str,
        priority: i32,
        fail: bool,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn SyncDataHandler> {
        Arc::new(Recording {
            key,
            priority,
            data: key.as_bytes().to_vec(),
            fail,
            log: log.clone(),
        })
    }

    #[test]
    fn test_handlers_ordered_by_priority_then_key() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = DataSyncRegistry::new();
        registry.register(recording("tasks", 10, false, &log));
        registry.register(recording("groups", 0, false, &log));
        registry.register(recording("permissions", 0, false, &log));

        assert_eq!(registry.keys(), vec!["groups", "permissions", "tasks"]);
        let payload = registry.prepare_cluster_data("node-2", true);
        let keys: Vec<_> = payload.chunks.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["groups", "permissions", "tasks"]);
    }

    #[test]
    fn test_register_replaces_same_key() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = DataSyncRegistry::new();
        registry.register(recording("tasks", 0, false, &log));
        registry.register(recording("tasks", 5, false, &log));
        assert_eq!(registry.keys(), vec!["tasks"]);
        assert!(registry.unregister("tasks"));
        assert!(!registry.unregister("tasks"));
    }

    #[test]
    fn test_apply_follows_payload_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = DataSyncRegistry::new();
        // The receiver's own order would be a, b.
        registry.register(recording("b", 1, false, &log));
        registry.register(recording("a", 0, false, &log));

        let payload = ClusterDataPayload {
            force: true,
            chunks: vec![
                ClusterDataChunk {
                    key: "b".into(),
                    data: b"2".to_vec(),
                },
                ClusterDataChunk {
                    key: "a".into(),
                    data: b"1".to_vec(),
                },
            ],
        };
        let report = registry.apply_cluster_data(&payload);
        assert_eq!(report.applied, 2);
        assert_eq!(*log.lock(), vec!["b:2", "a:1"]);
    }

    #[test]
    fn test_failing_and_unknown_chunks_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = DataSyncRegistry::new();
        registry.register(recording("good", 0, false, &log));
        registry.register(recording("bad", 0, true, &log));

        let payload = ClusterDataPayload {
            force: false,
            chunks: vec![
                ClusterDataChunk {
                    key: "bad".into(),
                    data: b"x".to_vec(),
                },
                ClusterDataChunk {
                    key: "mystery".into(),
                    data: b"y".to_vec(),
                },
                ClusterDataChunk {
                    key: "good".into(),
                    data: b"z".to_vec(),
                },
            ],
        };
        let report = registry.apply_cluster_data(&payload);
        assert_eq!(
            report,
            SyncReport {
                applied: 1,
                skipped: 1,
                failed: 1,
            }
        );
        assert_eq!(*log.lock(), vec!["good:z"]);
    }

    #[test]
    fn test_failing_prepare_left_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = DataSyncRegistry::new();
        registry.register(recording("good", 0, false, &log));
        registry.register(recording("bad", 0, true, &log));

        let payload = registry.prepare_cluster_data("node-2", true);
        assert!(payload.force);
        assert_eq!(payload.chunks.len(), 1);
        assert_eq!(payload.chunks[0].key, "good");
    }
}
