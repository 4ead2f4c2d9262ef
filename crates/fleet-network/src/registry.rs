//! Packet listener registry -- maps (channel tag, packet id) to listeners.
//!
//! Listeners for the same key run in registration order. A listener that
//! fails or panics is logged and the remaining listeners still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use fleet_protocol::Packet;
use parking_lot::RwLock;

use crate::channel::Channel;

pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Handles packets for one (tag, id) key.
pub trait PacketListener: Send + Sync {
    fn handle(&self, channel: &Channel, packet: &Packet) -> ListenerResult;
}

impl<F> PacketListener for F
where
    F: Fn(&Channel, &Packet) -> ListenerResult + Send + Sync,
{
    fn handle(&self, channel: &Channel, packet: &Packet) -> ListenerResult {
        self(channel, packet)
    }
}

type ListenerKey = (String, u32);

/// Listener registry scoped to one channel.
#[derive(Clone, Default)]
pub struct PacketListenerRegistry {
    inner: Arc<RwLock<HashMap<ListenerKey, Vec<Arc<dyn PacketListener>>>>>,
}

impl PacketListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener for `(tag, id)`.
    pub fn register(&self, tag: impl Into<String>, id: u32, listener: Arc<dyn PacketListener>) {
        self.inner
            .write()
            .entry((tag.into(), id))
            .or_default()
            .push(listener);
    }

    /// Remove every listener registered under `tag`. Returns how many were removed.
    pub fn remove(&self, tag: &str) -> usize {
        let mut inner = self.inner.write();
        let mut removed = 0;
        inner.retain(|(key_tag, _), listeners| {
            if key_tag == tag {
                removed += listeners.len();
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove `remove_tag` and register `additions` under one lock, so no
    /// packet is dispatched to a mix of the old and new listener sets.
    pub fn replace(
        &self,
        remove_tag: &str,
        additions: Vec<(String, u32, Arc<dyn PacketListener>)>,
    ) {
        let mut inner = self.inner.write();
        inner.retain(|(key_tag, _), _| key_tag != remove_tag);
        for (tag, id, listener) in additions {
            inner.entry((tag, id)).or_default().push(listener);
        }
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn has_listeners(&self, tag: &str) -> bool {
        self.inner.read().keys().any(|(key_tag, _)| key_tag == tag)
    }

    pub fn listener_count(&self, tag: &str, id: u32) -> usize {
        self.inner
            .read()
            .get(&(tag.to_string(), id))
            .map_or(0, Vec::len)
    }

    /// Invoke every listener for the packet's key. Returns how many ran.
    ///
    /// The listener list is copied out before invocation so listeners may
    /// modify the registry (e.g. swap the auth listener) while handling.
    pub fn dispatch(&self, channel: &Channel, packet: &Packet) -> usize {
        let listeners: Vec<Arc<dyn PacketListener>> = match self
            .inner
            .read()
            .get(&(packet.channel().to_string(), packet.id()))
        {
            Some(listeners) => listeners.clone(),
            None => return 0,
        };

        for listener in &listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.handle(channel, packet))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        tag = packet.channel(),
                        id = packet.id(),
                        remote = %channel.remote_addr(),
                        "packet listener failed: {e}"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        tag = packet.channel(),
                        id = packet.id(),
                        remote = %channel.remote_addr(),
                        "packet listener panicked"
                    );
                }
            }
        }
        listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::NoopHandler;
    use parking_lot::Mutex;

    fn detached_channel() -> Channel {
        let (channel, _peer) = Channel::in_memory_pair(
            1024 * 1024,
            Arc::new(NoopHandler),
            Arc::new(NoopHandler),
        );
        channel
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Arc<dyn PacketListener> {
        let log = log.clone();
        Arc::new(move |_: &Channel, _: &Packet| -> ListenerResult {
            log.lock().push(name);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_dispatch_in_registration_order() {
        let registry = PacketListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register("t", 1, recorder(&log, "first"));
        registry.register("t", 1, recorder(&log, "second"));
        registry.register("t", 2, recorder(&log, "other-id"));

        let channel = detached_channel();
        let invoked = registry.dispatch(&channel, &Packet::new("t", 1, Vec::new()));
        assert_eq!(invoked, 2);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_stop_others() {
        let registry = PacketListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(
            "t",
            1,
            Arc::new(|_: &Channel, _: &Packet| -> ListenerResult { Err("boom".into()) }),
        );
        registry.register(
            "t",
            1,
            Arc::new(|_: &Channel, _: &Packet| -> ListenerResult { panic!("listener bug") }),
        );
        registry.register("t", 1, recorder(&log, "survivor"));

        let channel = detached_channel();
        assert_eq!(registry.dispatch(&channel, &Packet::new("t", 1, Vec::new())), 3);
        assert_eq!(*log.lock(), vec!["survivor"]);
    }

    #[tokio::test]
    async fn test_remove_by_tag() {
        let registry = PacketListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register("auth", 1, recorder(&log, "a"));
        registry.register("auth", 2, recorder(&log, "b"));
        registry.register("rpc", 1, recorder(&log, "c"));

        assert_eq!(registry.remove("auth"), 2);
        assert!(!registry.has_listeners("auth"));
        assert!(registry.has_listeners("rpc"));

        let channel = detached_channel();
        assert_eq!(registry.dispatch(&channel, &Packet::new("auth", 1, Vec::new())), 0);
    }

    #[tokio::test]
    async fn test_replace_swaps_atomically() {
        let registry = PacketListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register("auth", 1, recorder(&log, "auth"));

        registry.replace(
            "auth",
            vec![
                ("rpc".to_string(), 1, recorder(&log, "rpc")),
                ("msg".to_string(), 1, recorder(&log, "msg")),
            ],
        );

        assert_eq!(registry.listener_count("auth", 1), 0);
        assert_eq!(registry.listener_count("rpc", 1), 1);
        assert_eq!(registry.listener_count("msg", 1), 1);
    }

    #[tokio::test]
    async fn test_listener_may_modify_registry_while_dispatching() {
        let registry = PacketListenerRegistry::new();
        let inner = registry.clone();
        registry.register(
            "auth",
            1,
            Arc::new(move |_: &Channel, _: &Packet| -> ListenerResult {
                inner.remove("auth");
                Ok(())
            }),
        );

        let channel = detached_channel();
        assert_eq!(registry.dispatch(&channel, &Packet::new("auth", 1, Vec::new())), 1);
        assert!(!registry.has_listeners("auth"));
    }
}
