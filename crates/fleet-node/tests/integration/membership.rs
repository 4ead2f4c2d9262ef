//! Membership: handshake, head election, rejection and reconnect.

use std::collections::BTreeMap;
use std::time::Duration;

use fleet_cluster::NodeServerState;
use fleet_node::data::TaskConfig;
use fleet_node::internal;
use uuid::Uuid;

use crate::harness::{free_port, wait_until, TestCluster, TestNodeBuilder};

const TIMEOUT: Duration = Duration::from_secs(15);

fn task(name: &str) -> TaskConfig {
    TaskConfig {
        name: name.into(),
        groups: vec!["global".into()],
        templates: vec![],
        max_heap_memory: 512,
        min_service_count: 1,
        maintenance: false,
        properties: BTreeMap::new(),
        revision: 0,
    }
}

/// Two nodes reach Ready on both sides and agree on the head.
#[tokio::test]
async fn test_two_node_handshake() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.wait_full_mesh(TIMEOUT).await.unwrap();

    for node in &cluster.nodes {
        assert_eq!(node.ctx().provider.head_id().as_deref(), Some("node-1"));
        let peer = if node.unique_id == "node-1" { "node-2" } else { "node-1" };
        assert!(node.ctx().provider.node(peer).unwrap().channel().is_some());
    }
    assert!(cluster.node("node-1").ctx().provider.is_head());
    assert!(!cluster.node("node-2").ctx().provider.is_head());

    cluster.shutdown_all().await;
}

/// Three nodes form a full mesh even though every pair dials at once.
#[tokio::test]
async fn test_three_node_mesh() {
    let cluster = TestCluster::start(3).await.unwrap();
    cluster.wait_full_mesh(TIMEOUT).await.unwrap();
    for node in &cluster.nodes {
        assert_eq!(node.ctx().provider.available_peers().len(), 2);
    }
    cluster.shutdown_all().await;
}

/// Node info snapshots are published on the tick and land on the peer.
#[tokio::test]
async fn test_node_info_published() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.wait_full_mesh(TIMEOUT).await.unwrap();

    let node_1 = cluster.node("node-1");
    let node_2 = cluster.node("node-2");
    node_2.ctx().set_draining(true);

    wait_until("node-1 to see node-2 draining", TIMEOUT, || {
        node_1
            .ctx()
            .provider
            .node("node-2")
            .and_then(|server| server.node_info())
            .is_some_and(|info| info.draining)
    })
    .await
    .unwrap();

    cluster.shutdown_all().await;
}

/// Nodes of different clusters never get past the handshake.
#[tokio::test]
async fn test_cluster_id_mismatch_rejected() {
    let (port_1, port_2) = (free_port(), free_port());
    let node_1 = TestNodeBuilder::new("node-1")
        .cluster_id(Uuid::new_v4())
        .port(port_1)
        .peer("node-2", port_2)
        .build()
        .await
        .unwrap();
    let node_2 = TestNodeBuilder::new("node-2")
        .cluster_id(Uuid::new_v4())
        .port(port_2)
        .peer("node-1", port_1)
        .build()
        .await
        .unwrap();

    // Several connector rounds.
    tokio::time::sleep(Duration::from_secs(3)).await;

    for (node, peer) in [(&node_1, "node-2"), (&node_2, "node-1")] {
        let state = node.peer_state(peer).unwrap();
        assert!(!state.is_ready(), "{} sees {peer} as {}", node.unique_id, state.name());
        assert!(node.ctx().provider.node(peer).unwrap().channel().is_none());
    }

    node_1.shutdown().await;
    node_2.shutdown().await;
}

/// A peer that goes away is Disconnected; once it returns both sides are
/// Ready again and an on-demand resync carries data written meanwhile.
#[tokio::test]
async fn test_peer_restart_reconnects() {
    let cluster_id = Uuid::new_v4();
    let (port_1, port_2) = (free_port(), free_port());
    let node_1 = TestNodeBuilder::new("node-1")
        .cluster_id(cluster_id)
        .port(port_1)
        .peer("node-2", port_2)
        .build()
        .await
        .unwrap();
    let node_2 = TestNodeBuilder::new("node-2")
        .cluster_id(cluster_id)
        .port(port_2)
        .peer("node-1", port_1)
        .build()
        .await
        .unwrap();
    node_1.wait_all_ready(TIMEOUT).await.unwrap();
    node_2.wait_all_ready(TIMEOUT).await.unwrap();

    node_2.shutdown().await;
    node_1
        .wait_peer_state("node-2", NodeServerState::Disconnected, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(node_1.ctx().provider.head_id().as_deref(), Some("node-1"));

    node_1.ctx().data.tasks.upsert(task("lobby"));

    let node_2 = TestNodeBuilder::new("node-2")
        .cluster_id(cluster_id)
        .port(port_2)
        .peer("node-1", port_1)
        .build()
        .await
        .unwrap();
    node_1
        .wait_peer_state("node-2", NodeServerState::Ready, TIMEOUT)
        .await
        .unwrap();
    node_2.wait_all_ready(TIMEOUT).await.unwrap();

    assert!(internal::sync_cluster_data(node_1.ctx(), "node-2", true));
    wait_until("node-2 to receive the lobby task", TIMEOUT, || {
        node_2.ctx().data.tasks.get("lobby").is_some()
    })
    .await
    .unwrap();

    node_1.shutdown().await;
    node_2.shutdown().await;
}

/// Remote shutdown stops the addressed node and the other side notices.
#[tokio::test]
async fn test_remote_shutdown() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.wait_full_mesh(TIMEOUT).await.unwrap();

    let mut stopped = cluster.node("node-2").ctx().subscribe_shutdown();
    internal::shutdown_node(cluster.node("node-1").ctx(), "node-2");
    tokio::time::timeout(TIMEOUT, stopped.recv())
        .await
        .expect("node-2 was not asked to shut down")
        .unwrap();

    cluster.shutdown_all().await;
}
