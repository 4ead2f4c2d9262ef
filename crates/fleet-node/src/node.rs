//! Node startup -- listeners, tick loop and peer connector.

use std::net::SocketAddr;
use std::sync::Arc;

use fleet_network::{NetworkClient, NetworkServer, TransportSecurity};
use fleet_storage::TemplateStorageProvider;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::auth::NodeConnector;
use crate::config::NodeConfig;
use crate::context::NodeContext;
use crate::expand_tilde;
use crate::identity::TransportKey;
use crate::tick;

/// A started node and its background tasks.
pub struct RunningNode {
    pub ctx: Arc<NodeContext>,
    listen_addrs: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: broadcast::Receiver<()>,
}

fn transport_security(config: &NodeConfig) -> anyhow::Result<TransportSecurity> {
    if !config.network.encryption {
        return Ok(TransportSecurity::Plain);
    }
    let key_path = expand_tilde(&config.network.transport_key);
    let key = TransportKey::load_or_create(&key_path)?;
    tracing::info!(fingerprint = %key.fingerprint(), "transport encryption enabled");
    Ok(TransportSecurity::Encrypted {
        node_id: config.node.unique_id.clone(),
        pkcs8_der: key.pkcs8_der().to_vec(),
    })
}

/// Bind every listener and start the node's loops. Must run inside a runtime.
pub async fn start(config: &NodeConfig) -> anyhow::Result<RunningNode> {
    let security = transport_security(config)?;
    let template_dir = expand_tilde(&config.templates.directory);
    let templates = TemplateStorageProvider::with_local(&template_dir)?;
    let ctx = NodeContext::new(config, templates);
    let shutdown = ctx.subscribe_shutdown();
    let max_frame_bytes = ctx.limits().max_frame_bytes;

    tracing::info!(
        node = %ctx.local_id(),
        cluster = %ctx.cluster_id(),
        peers = config.peers().len(),
        templates = %template_dir.display(),
        version = env!("CARGO_PKG_VERSION"),
        "starting fleet-node"
    );

    let mut tasks = Vec::new();
    let mut listen_addrs = Vec::new();
    for addr in config.listen_addrs()? {
        let server = NetworkServer::bind(addr, &security, ctx.channel_handler(true), max_frame_bytes).await?;
        let bound = server.local_addr()?;
        tracing::info!(addr = %bound, encrypted = security.is_encrypted(), "listening");
        listen_addrs.push(bound);
        tasks.push(tokio::spawn(server.serve(ctx.subscribe_shutdown())));
    }

    tasks.push(tokio::spawn(tick::run_tick_loop(ctx.clone(), ctx.subscribe_shutdown())));

    let connector = NodeConnector::new(ctx.clone(), NetworkClient::new(&security, max_frame_bytes)?);
    tasks.push(tokio::spawn(tick::run_connector_loop(connector, ctx.subscribe_shutdown())));

    Ok(RunningNode {
        ctx,
        listen_addrs,
        tasks,
        shutdown,
    })
}

impl RunningNode {
    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.listen_addrs
    }

    /// Resolves once shutdown was requested, locally or by the cluster.
    pub async fn wait(&mut self) {
        let _ = self.shutdown.recv().await;
    }

    /// Stop the loops and close every peer and service channel.
    pub async fn shutdown(self) {
        self.ctx.trigger_shutdown();
        for peer in self.ctx.provider.peers() {
            if let Some(channel) = peer.channel() {
                channel.close();
            }
        }
        for (_, channel) in self.ctx.local_services.connected() {
            channel.close();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!(node = %self.ctx.local_id(), "shutdown complete");
    }
}
