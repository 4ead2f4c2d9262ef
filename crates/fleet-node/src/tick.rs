//! Tick loop -- periodic node housekeeping, 20 ticks per second.
//!
//! Each tick applies requested service lifecycle changes, publishes node
//! info every `node_info_publish_ticks`, closes peers that went silent and
//! drops idle chunk sessions. Work that must not interleave with a tick
//! (template writes) holds a `TickGate` pause for its duration.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockWriteGuard};
use tokio::sync::broadcast;

use crate::auth::NodeConnector;
use crate::context::NodeContext;
use crate::internal;

/// Single-writer gate between the tick loop and work that pauses it.
#[derive(Clone, Default)]
pub struct TickGate {
    inner: Arc<RwLock<()>>,
}

/// Holds the tick loop paused until dropped.
pub struct TickPause<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Drop for TickPause<'_> {
    fn drop(&mut self) {
        tracing::debug!("tick loop resumed");
    }
}

impl TickGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause the tick loop. Waits for a running tick to finish.
    pub fn pause(&self) -> TickPause<'_> {
        let guard = self.inner.write();
        tracing::debug!("tick loop paused");
        TickPause { _guard: guard }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.is_locked_exclusive()
    }

    /// Run `f` unless the loop is paused. Returns whether it ran.
    pub fn run<F: FnOnce()>(&self, f: F) -> bool {
        match self.inner.try_read() {
            Some(_guard) => {
                f();
                true
            }
            None => false,
        }
    }
}

/// One tick of housekeeping. `tick` counts from zero.
pub fn run_tick(ctx: &NodeContext, tick: u64) {
    for snapshot in ctx.local_services.apply_pending() {
        tracing::info!(
            service = %snapshot.service_id.name(),
            lifecycle = snapshot.lifecycle.name(),
            "service lifecycle changed"
        );
        internal::publish_service_info(ctx, &snapshot);
    }

    let limits = ctx.limits();
    if tick % limits.node_info_publish_ticks.max(1) == 0 {
        internal::publish_node_info(ctx);

        let timeout = Duration::from_secs(limits.node_stale_timeout_secs);
        for peer in ctx.provider.stale_peers(timeout) {
            tracing::warn!(
                peer = %peer.unique_id(),
                timeout_secs = limits.node_stale_timeout_secs,
                "no node info from peer, closing channel"
            );
            if let Some(channel) = peer.channel() {
                channel.close();
            }
        }
    }

    let expired = ctx.chunks.reap_expired();
    if expired > 0 {
        tracing::debug!(expired, "dropped idle chunk sessions");
    }
}

/// Tick until shutdown. Ticks that fall behind are skipped, not replayed.
pub async fn run_tick_loop(ctx: Arc<NodeContext>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(Duration::from_millis(ctx.limits().tick_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("tick loop shutting down");
                return;
            }
            _ = interval.tick() => {
                if ctx.tick_gate.run(|| run_tick(&ctx, tick)) {
                    tick = tick.wrapping_add(1);
                } else {
                    tracing::trace!("tick skipped, loop paused");
                }
            }
        }
    }
}

/// Dial every configured peer that is not connected, until shutdown.
pub async fn run_connector_loop(connector: NodeConnector, mut shutdown: broadcast::Receiver<()>) {
    let period = Duration::from_secs(connector.context().limits().reconnect_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("connector loop shutting down");
                return;
            }
            _ = interval.tick() => connector.connect_all().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;
    use fleet_protocol::{ServiceConfiguration, ServiceLifecycle};
    use std::collections::BTreeSet;

    #[test]
    fn test_gate_skips_while_paused() {
        let gate = TickGate::new();
        let mut runs = 0;
        assert!(gate.run(|| runs += 1));
        {
            let _pause = gate.pause();
            assert!(gate.is_paused());
            assert!(!gate.run(|| runs += 1));
        }
        assert!(!gate.is_paused());
        assert!(gate.run(|| runs += 1));
        assert_eq!(runs, 2);
    }

    #[test]
    fn test_pause_released_on_panic() {
        let gate = TickGate::new();
        let inner = gate.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _pause = inner.pause();
            panic!("deploy failed");
        }));
        assert!(result.is_err());
        assert!(!gate.is_paused());
    }

    #[tokio::test]
    async fn test_tick_applies_lifecycle_requests() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        let config = ServiceConfiguration {
            task_name: "lobby".into(),
            groups: vec![],
            task_service_id: None,
            properties: Default::default(),
        };
        let (snapshot, _) = ctx.local_services.create(config, &BTreeSet::new()).unwrap();
        let id = snapshot.service_id.unique_id;
        ctx.local_services
            .request_lifecycle(&id, ServiceLifecycle::Running)
            .unwrap();
        assert_eq!(ctx.local_services.get(&id).unwrap().lifecycle, ServiceLifecycle::Prepared);

        run_tick(&ctx, 1);
        assert_eq!(ctx.local_services.get(&id).unwrap().lifecycle, ServiceLifecycle::Running);
        // The local cluster view follows the published snapshot.
        assert_eq!(ctx.services.get(&id).unwrap().lifecycle, ServiceLifecycle::Running);
    }

    #[tokio::test]
    async fn test_tick_publishes_local_node_info() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = context(dir.path());
        let local = ctx.provider.local_node();
        assert!(local.node_info().is_none());
        run_tick(&ctx, 0);
        assert_eq!(local.node_info().unwrap().unique_id, "node-1");
    }
}
