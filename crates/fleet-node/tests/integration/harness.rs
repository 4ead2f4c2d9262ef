//! Test harness for in-process fleet-node integration tests.
//!
//! Provides TestNode (one running node), TestNodeBuilder (config) and
//! TestCluster (N nodes that list each other as peers), all sharing the
//! test's tokio runtime and talking over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_cluster::NodeServerState;
use fleet_node::config::{ClusterNodeEntry, NodeConfig};
use fleet_node::context::NodeContext;
use fleet_node::node::{self, RunningNode};
use uuid::Uuid;

/// Reserve a loopback port by binding and dropping a listener.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `check` until it holds, or fail with `what` after `timeout`.
pub async fn wait_until<F>(what: &str, timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub struct TestNodeBuilder {
    unique_id: String,
    cluster_id: Uuid,
    port: u16,
    peers: Vec<(String, u16)>,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(unique_id: &str) -> Self {
        Self {
            unique_id: unique_id.into(),
            cluster_id: Uuid::nil(),
            port: free_port(),
            peers: Vec::new(),
        }
    }

    pub fn cluster_id(mut self, cluster_id: Uuid) -> Self {
        self.cluster_id = cluster_id;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn peer(mut self, unique_id: &str, port: u16) -> Self {
        self.peers.push((unique_id.into(), port));
        self
    }

    pub fn config(&self, template_dir: &std::path::Path) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.unique_id = self.unique_id.clone();
        config.node.cluster_id = self.cluster_id;
        config.network.listeners = vec![format!("127.0.0.1:{}", self.port)];
        config.network.worker_threads = Some(2);
        config.cluster.nodes = self
            .peers
            .iter()
            .map(|(id, port)| ClusterNodeEntry {
                unique_id: id.clone(),
                listeners: vec![format!("127.0.0.1:{port}")],
            })
            .collect();
        config.templates.directory = template_dir.to_string_lossy().into_owned();
        config.tick.interval_ms = 20;
        config.tick.reconnect_interval_secs = 1;
        config
    }

    pub async fn build(self) -> anyhow::Result<TestNode> {
        let tempdir = tempfile::TempDir::new()?;
        let config = self.config(tempdir.path());
        let node = node::start(&config).await?;
        Ok(TestNode {
            unique_id: self.unique_id,
            port: self.port,
            node,
            _tempdir: tempdir,
        })
    }
}

/// A running in-process node with its listener, tick and connector tasks.
pub struct TestNode {
    pub unique_id: String,
    pub port: u16,
    node: RunningNode,
    _tempdir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestNode {
    pub fn ctx(&self) -> &Arc<NodeContext> {
        &self.node.ctx
    }

    pub fn addr(&self) -> SocketAddr {
        self.node.listen_addrs()[0]
    }

    pub fn peer_state(&self, peer: &str) -> Option<NodeServerState> {
        self.ctx().provider.node(peer).map(|server| server.state())
    }

    /// Poll until this node sees `peer` in `state`.
    pub async fn wait_peer_state(
        &self,
        peer: &str,
        state: NodeServerState,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let what = format!("{} to see {peer} as {}", self.unique_id, state.name());
        wait_until(&what, timeout, || self.peer_state(peer) == Some(state)).await
    }

    /// Poll until this node sees every peer Ready.
    pub async fn wait_all_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        let what = format!("{} to see all peers ready", self.unique_id);
        wait_until(&what, timeout, || {
            self.ctx().provider.peers().all(|peer| peer.state().is_ready())
        })
        .await
    }

    pub async fn shutdown(self) {
        self.node.shutdown().await;
    }
}

/// N nodes named `node-1..node-N`, each listing all others.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

#[allow(dead_code)]
impl TestCluster {
    pub async fn start(n: usize) -> anyhow::Result<Self> {
        let cluster_id = Uuid::new_v4();
        let ports: Vec<u16> = (0..n).map(|_| free_port()).collect();
        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let mut builder = TestNodeBuilder::new(&format!("node-{}", i + 1))
                .cluster_id(cluster_id)
                .port(ports[i]);
            for (j, port) in ports.iter().enumerate() {
                if j != i {
                    builder = builder.peer(&format!("node-{}", j + 1), *port);
                }
            }
            nodes.push(builder.build().await?);
        }
        Ok(Self { nodes })
    }

    pub fn node(&self, unique_id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.unique_id == unique_id)
            .unwrap_or_else(|| panic!("no test node {unique_id}"))
    }

    pub async fn wait_full_mesh(&self, timeout: Duration) -> anyhow::Result<()> {
        for node in &self.nodes {
            node.wait_all_ready(timeout).await?;
        }
        Ok(())
    }

    pub async fn shutdown_all(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}
