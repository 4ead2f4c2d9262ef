//! Transport -- listeners and dialers that turn connections into channels.
//!
//! Plain transport is TCP. With encryption enabled the same packet stream runs
//! over one bidirectional QUIC stream per connection, secured by a
//! self-signed certificate (see `fleet_protocol::tls`). QUIC keeps idle links
//! alive and drops them after the node stale timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::tls::{self, NodeCertificate, TlsError};
use fleet_protocol::DEFAULT_LIMITS;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::channel::{Channel, ChannelHandler, ChannelInfo};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error(transparent)]
    Certificate(#[from] TlsError),
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: SocketAddr, reason: String },
}

/// Whether connections are encrypted.
#[derive(Clone)]
pub enum TransportSecurity {
    Plain,
    /// QUIC with a certificate for `node_id` issued from this Ed25519
    /// PKCS#8 key.
    Encrypted { node_id: String, pkcs8_der: Vec<u8> },
}

impl TransportSecurity {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, TransportSecurity::Encrypted { .. })
    }
}

fn quic_transport() -> Result<Arc<quinn::TransportConfig>, TransportError> {
    let idle = Duration::from_secs(DEFAULT_LIMITS.node_stale_timeout_secs);
    let mut transport = quinn::TransportConfig::default();
    transport
        .max_idle_timeout(Some(
            quinn::IdleTimeout::try_from(idle).map_err(|e| TransportError::Tls(e.to_string()))?,
        ))
        .keep_alive_interval(Some(idle / 6));
    Ok(Arc::new(transport))
}

fn quic_server_config(node_id: &str, pkcs8_der: &[u8]) -> Result<quinn::ServerConfig, TransportError> {
    let crypto = NodeCertificate::issue(node_id, pkcs8_der)?.server_crypto()?;
    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(quic_transport()?);
    Ok(config)
}

fn quic_client_config() -> Result<quinn::ClientConfig, TransportError> {
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls::client_crypto())
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(quic_transport()?);
    Ok(config)
}

enum Acceptor {
    Tcp(TcpListener),
    Quic(quinn::Endpoint),
}

/// Accepts inbound connections on one address.
pub struct NetworkServer {
    acceptor: Acceptor,
    handler: Arc<dyn ChannelHandler>,
    max_frame_bytes: usize,
}

impl NetworkServer {
    pub async fn bind(
        addr: SocketAddr,
        security: &TransportSecurity,
        handler: Arc<dyn ChannelHandler>,
        max_frame_bytes: usize,
    ) -> Result<Self, TransportError> {
        let acceptor = match security {
            TransportSecurity::Plain => Acceptor::Tcp(TcpListener::bind(addr).await?),
            TransportSecurity::Encrypted { node_id, pkcs8_der } => {
                let server_config = quic_server_config(node_id, pkcs8_der)?;
                Acceptor::Quic(quinn::Endpoint::server(server_config, addr)?)
            }
        };
        Ok(Self {
            acceptor,
            handler,
            max_frame_bytes,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(match &self.acceptor {
            Acceptor::Tcp(listener) => listener.local_addr()?,
            Acceptor::Quic(endpoint) => endpoint.local_addr()?,
        })
    }

    /// Run the accept loop until shutdown. Each connection becomes a channel.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<()>) {
        let local = self.local_addr().ok();
        tracing::info!(addr = ?local, encrypted = matches!(self.acceptor, Acceptor::Quic(_)), "listening");

        match &self.acceptor {
            Acceptor::Tcp(listener) => loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            if let Err(e) = self.adopt_tcp(stream, remote) {
                                tracing::warn!(%remote, "failed to adopt connection: {e}");
                            }
                        }
                        Err(e) => {
                            tracing::warn!("failed to accept connection: {e}");
                        }
                    },
                    _ = shutdown.recv() => {
                        tracing::info!("shutdown signal, stopping accept loop");
                        break;
                    }
                }
            },
            Acceptor::Quic(endpoint) => loop {
                tokio::select! {
                    incoming = endpoint.accept() => match incoming {
                        Some(incoming) => {
                            let handler = self.handler.clone();
                            let max_frame_bytes = self.max_frame_bytes;
                            let local_addr = endpoint.local_addr().ok();
                            tokio::spawn(async move {
                                match accept_quic(incoming, local_addr, handler, max_frame_bytes).await {
                                    Ok(channel) => {
                                        tracing::info!(remote = %channel.remote_addr(), "accepted inbound connection");
                                    }
                                    Err(e) => tracing::warn!("failed to accept connection: {e}"),
                                }
                            });
                        }
                        None => {
                            tracing::info!("endpoint closed, stopping accept loop");
                            break;
                        }
                    },
                    _ = shutdown.recv() => {
                        tracing::info!("shutdown signal, stopping accept loop");
                        endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
                        break;
                    }
                }
            },
        }
    }

    fn adopt_tcp(&self, stream: TcpStream, remote: SocketAddr) -> Result<Channel, TransportError> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        tracing::info!(%remote, "accepted inbound connection");
        Ok(Channel::spawn(
            reader,
            writer,
            ChannelInfo {
                remote_addr: remote,
                local_addr,
                encrypted: false,
            },
            self.max_frame_bytes,
            self.handler.clone(),
        ))
    }
}

async fn accept_quic(
    incoming: quinn::Incoming,
    local_addr: Option<SocketAddr>,
    handler: Arc<dyn ChannelHandler>,
    max_frame_bytes: usize,
) -> Result<Channel, TransportError> {
    let remote = incoming.remote_address();
    let conn = incoming.await.map_err(|e| TransportError::Connect {
        addr: remote,
        reason: e.to_string(),
    })?;
    // The dialer opens exactly one stream and writes its auth request first.
    let (send, recv) = conn.accept_bi().await.map_err(|e| TransportError::Connect {
        addr: remote,
        reason: e.to_string(),
    })?;
    Ok(Channel::spawn(
        recv,
        send,
        ChannelInfo {
            remote_addr: remote,
            local_addr: local_addr.unwrap_or(remote),
            encrypted: true,
        },
        max_frame_bytes,
        handler,
    ))
}

/// Dials outbound connections.
pub struct NetworkClient {
    quic: Option<(quinn::Endpoint, quinn::ClientConfig)>,
    max_frame_bytes: usize,
}

impl NetworkClient {
    /// Must be called inside a runtime when `security` is encrypted.
    pub fn new(security: &TransportSecurity, max_frame_bytes: usize) -> Result<Self, TransportError> {
        let quic = match security {
            TransportSecurity::Plain => None,
            TransportSecurity::Encrypted { .. } => {
                let client_config = quic_client_config()?;
                let endpoint = quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;
                Some((endpoint, client_config))
            }
        };
        Ok(Self {
            quic,
            max_frame_bytes,
        })
    }

    pub async fn connect(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Channel, TransportError> {
        match &self.quic {
            None => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                let local_addr = stream.local_addr()?;
                let (reader, writer) = stream.into_split();
                Ok(Channel::spawn(
                    reader,
                    writer,
                    ChannelInfo {
                        remote_addr: addr,
                        local_addr,
                        encrypted: false,
                    },
                    self.max_frame_bytes,
                    handler,
                ))
            }
            Some((endpoint, client_config)) => {
                let connect_err = |e: String| TransportError::Connect { addr, reason: e };
                let conn = endpoint
                    .connect_with(client_config.clone(), addr, tls::SERVER_NAME)
                    .map_err(|e| connect_err(e.to_string()))?
                    .await
                    .map_err(|e| connect_err(e.to_string()))?;
                let (send, recv) = conn.open_bi().await.map_err(|e| connect_err(e.to_string()))?;
                Ok(Channel::spawn(
                    recv,
                    send,
                    ChannelInfo {
                        remote_addr: addr,
                        local_addr: endpoint.local_addr()?,
                        encrypted: true,
                    },
                    self.max_frame_bytes,
                    handler,
                ))
            }
        }
    }
}
