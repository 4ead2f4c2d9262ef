//! RPC engine -- declarative dispatch tables on the provider side, chained
//! call builders on the sender side.
//!
//! A request carries a target interface id and a chain of calls. The first
//! call runs on the registered target; every later call runs on the handle
//! returned by the previous one, so `factory.provider(id).start()` costs a
//! single round trip. Methods are addressed by a SHA-256 fingerprint of their
//! interface, name and signature.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{
    tags, Packet, RpcCall, RpcFailure, RpcFailureKind, RpcRequest, RpcResponse,
    INTERNAL_PACKET_ID,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::channel::Channel;
use crate::registry::{ListenerResult, PacketListener};
use crate::{ChannelError, QueryError};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("failed to serialize rpc arguments: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no channel available for rpc target {0}")]
    NotConnected(String),
    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),
    #[error("channel closed during rpc")]
    ChannelClosed,
    #[error("rpc request not sent: {0}")]
    Send(fleet_protocol::ProtocolError),
    #[error("remote rpc failure ({}): {message}", .kind.name())]
    Remote {
        kind: RpcFailureKind,
        message: String,
    },
    #[error("failed to decode rpc response: {0}")]
    Decode(String),
}

impl From<QueryError> for RpcError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Timeout(timeout) => RpcError::Timeout(timeout),
            QueryError::Send(e) => e.into(),
            QueryError::Closed => RpcError::ChannelClosed,
        }
    }
}

impl From<ChannelError> for RpcError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Closed => RpcError::ChannelClosed,
            ChannelError::Protocol(e) => RpcError::Send(e),
        }
    }
}

// ============================================================================
// Method descriptors
// ============================================================================

/// Identifies one method of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub interface: &'static str,
    pub name: &'static str,
    /// Argument and result types, e.g. `(ServiceConfiguration)->ServiceInfoSnapshot`.
    pub signature: &'static str,
}

impl MethodDescriptor {
    pub const fn new(interface: &'static str, name: &'static str, signature: &'static str) -> Self {
        Self {
            interface,
            name,
            signature,
        }
    }

    /// First 8 bytes of SHA-256(`interface#name signature`), big-endian.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.interface.as_bytes());
        hasher.update(b"#");
        hasher.update(self.name.as_bytes());
        hasher.update(b" ");
        hasher.update(self.signature.as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }
}

// ============================================================================
// Provider side
// ============================================================================

/// Result of invoking one method.
pub enum RpcValue {
    Value(serde_json::Value),
    /// A target for the next call in the chain.
    Handle(Arc<dyn RpcTarget>),
}

/// Something calls can be dispatched to.
pub trait RpcTarget: Send + Sync {
    fn interface(&self) -> &str;
    fn invoke(&self, call: &RpcCall) -> Result<RpcValue, RpcFailure>;
}

type MethodFn<T> = Box<dyn Fn(&T, serde_json::Value) -> Result<RpcValue, RpcFailure> + Send + Sync>;

/// Declarative method registry for targets of type `T`: fingerprint → typed
/// closure plus the serde codec for its arguments and result.
pub struct RpcDispatchTable<T> {
    interface: &'static str,
    methods: HashMap<u64, (&'static str, MethodFn<T>)>,
}

impl<T: Send + Sync + 'static> RpcDispatchTable<T> {
    pub fn new(interface: &'static str) -> Self {
        Self {
            interface,
            methods: HashMap::new(),
        }
    }

    /// Register a method that returns a value.
    pub fn method<A, R, F>(mut self, descriptor: &MethodDescriptor, f: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(&T, A) -> Result<R, String> + Send + Sync + 'static,
    {
        let name = descriptor.name;
        let invoke: MethodFn<T> = Box::new(move |target: &T, args: serde_json::Value| {
            let args: A = decode_args(name, args)?;
            let result = f(target, args).map_err(|m| RpcFailure::new(RpcFailureKind::Remote, m))?;
            serde_json::to_value(result)
                .map(RpcValue::Value)
                .map_err(|e| RpcFailure::new(RpcFailureKind::Remote, format!("{name}: result encoding: {e}")))
        });
        self.methods.insert(descriptor.fingerprint(), (name, invoke));
        self
    }

    /// Register a method that returns a handle for chained calls.
    pub fn handle<A, F>(mut self, descriptor: &MethodDescriptor, f: F) -> Self
    where
        A: DeserializeOwned,
        F: Fn(&T, A) -> Result<Arc<dyn RpcTarget>, String> + Send + Sync + 'static,
    {
        let name = descriptor.name;
        let invoke: MethodFn<T> = Box::new(move |target: &T, args: serde_json::Value| {
            let args: A = decode_args(name, args)?;
            f(target, args)
                .map(RpcValue::Handle)
                .map_err(|m| RpcFailure::new(RpcFailureKind::Remote, m))
        });
        self.methods.insert(descriptor.fingerprint(), (name, invoke));
        self
    }

    pub fn interface(&self) -> &'static str {
        self.interface
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Bind the table to a concrete target instance.
    pub fn bind(self: &Arc<Self>, target: Arc<T>) -> Arc<dyn RpcTarget> {
        Arc::new(BoundTarget {
            target,
            table: self.clone(),
        })
    }
}

fn decode_args<A: DeserializeOwned>(method: &str, args: serde_json::Value) -> Result<A, RpcFailure> {
    serde_json::from_value(args)
        .map_err(|e| RpcFailure::new(RpcFailureKind::BadArguments, format!("{method}: {e}")))
}

struct BoundTarget<T> {
    target: Arc<T>,
    table: Arc<RpcDispatchTable<T>>,
}

impl<T: Send + Sync + 'static> RpcTarget for BoundTarget<T> {
    fn interface(&self) -> &str {
        self.table.interface
    }

    fn invoke(&self, call: &RpcCall) -> Result<RpcValue, RpcFailure> {
        match self.table.methods.get(&call.fingerprint) {
            Some((_, method)) => method(&self.target, call.args.clone()),
            None => Err(RpcFailure::new(
                RpcFailureKind::UnknownMethod,
                format!(
                    "{} has no method {} ({})",
                    self.table.interface,
                    call.method,
                    hex::encode(call.fingerprint.to_be_bytes())
                ),
            )),
        }
    }
}

/// Interface id → bound target. Installed as the listener for the RPC tag.
#[derive(Clone, Default)]
pub struct RpcProviderRegistry {
    targets: Arc<RwLock<HashMap<String, Arc<dyn RpcTarget>>>>,
}

impl RpcProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target: Arc<dyn RpcTarget>) {
        let name = target.interface().to_string();
        tracing::debug!(target = %name, "rpc target registered");
        self.targets.write().insert(name, target);
    }

    pub fn unregister(&self, interface: &str) -> bool {
        self.targets.write().remove(interface).is_some()
    }

    /// Evaluate a call chain.
    pub fn handle_request(&self, request: &RpcRequest) -> RpcResponse {
        let Some(mut current) = self.targets.read().get(&request.target).cloned() else {
            return RpcResponse::Failure(RpcFailure::new(
                RpcFailureKind::UnknownTarget,
                format!("no rpc target {}", request.target),
            ));
        };

        let last = request.calls.len().saturating_sub(1);
        for (index, call) in request.calls.iter().enumerate() {
            match current.invoke(call) {
                Err(failure) => return RpcResponse::Failure(failure),
                Ok(RpcValue::Handle(next)) if index < last => current = next,
                Ok(RpcValue::Value(value)) if index == last => {
                    return RpcResponse::Success { value };
                }
                Ok(RpcValue::Handle(_)) => {
                    return RpcResponse::Failure(RpcFailure::new(
                        RpcFailureKind::ChainMismatch,
                        format!("call chain ends on handle returned by {}", call.method),
                    ));
                }
                Ok(RpcValue::Value(_)) => {
                    return RpcResponse::Failure(RpcFailure::new(
                        RpcFailureKind::ChainMismatch,
                        format!("{} returned a value but the chain continues", call.method),
                    ));
                }
            }
        }

        RpcResponse::Failure(RpcFailure::new(
            RpcFailureKind::BadArguments,
            "empty call chain",
        ))
    }
}

impl PacketListener for RpcProviderRegistry {
    fn handle(&self, channel: &Channel, packet: &Packet) -> ListenerResult {
        let response = match packet.decode_json::<RpcRequest>() {
            Ok(request) => {
                let response = self.handle_request(&request);
                if let RpcResponse::Failure(failure) = &response {
                    tracing::debug!(
                        target = %request.target,
                        kind = failure.kind.name(),
                        "rpc failed: {}",
                        failure.message
                    );
                }
                if !request.expects_result {
                    return Ok(());
                }
                response
            }
            Err(e) => RpcResponse::Failure(RpcFailure::new(
                RpcFailureKind::BadArguments,
                format!("undecodable rpc request: {e}"),
            )),
        };

        if packet.is_query() {
            channel.send(Packet::json_response_to(packet, &response)?)?;
        }
        Ok(())
    }
}

// ============================================================================
// Sender side
// ============================================================================

/// Supplies the channel an RPC goes out on, resolved at send time.
pub type ChannelSupplier = Arc<dyn Fn() -> Option<Channel> + Send + Sync>;

/// Sends calls to one remote interface.
#[derive(Clone)]
pub struct RpcSender {
    target: String,
    supplier: ChannelSupplier,
    timeout: Duration,
}

impl RpcSender {
    pub fn new(target: impl Into<String>, supplier: ChannelSupplier) -> Self {
        Self {
            target: target.into(),
            supplier,
            timeout: Duration::from_secs(fleet_protocol::DEFAULT_LIMITS.query_timeout_secs),
        }
    }

    /// Sender bound to one fixed channel.
    pub fn fixed(target: impl Into<String>, channel: Channel) -> Self {
        Self::new(target, Arc::new(move || Some(channel.clone())))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Start a call chain with `method`.
    pub fn invoke<A: Serialize>(&self, method: &MethodDescriptor, args: A) -> RpcChain {
        RpcChain {
            sender: self.clone(),
            calls: Vec::new(),
            error: None,
        }
        .then(method, args)
    }
}

/// A call chain under construction. Serialization errors are held until the
/// chain is fired, so nothing is sent for a chain with bad arguments.
#[must_use = "an rpc chain does nothing until fired"]
pub struct RpcChain {
    sender: RpcSender,
    calls: Vec<RpcCall>,
    error: Option<serde_json::Error>,
}

impl RpcChain {
    /// Append a call on the handle the previous call returns.
    pub fn then<A: Serialize>(mut self, method: &MethodDescriptor, args: A) -> Self {
        if self.error.is_none() {
            match serde_json::to_value(args) {
                Ok(args) => self.calls.push(RpcCall {
                    method: method.name.to_string(),
                    fingerprint: method.fingerprint(),
                    args,
                }),
                Err(e) => self.error = Some(e),
            }
        }
        self
    }

    fn into_packet(self, expects_result: bool) -> Result<(RpcSender, Packet), RpcError> {
        if let Some(e) = self.error {
            return Err(RpcError::Serialize(e));
        }
        let request = RpcRequest {
            target: self.sender.target.clone(),
            calls: self.calls,
            expects_result,
        };
        let payload = serde_json::to_vec(&request)?;
        Ok((self.sender, Packet::new(tags::RPC, INTERNAL_PACKET_ID, payload)))
    }

    /// Send the chain and wait for the terminal value.
    pub async fn fire<R: DeserializeOwned>(self) -> Result<R, RpcError> {
        let (sender, packet) = self.into_packet(true)?;
        let channel = (sender.supplier)().ok_or_else(|| RpcError::NotConnected(sender.target.clone()))?;

        let response = channel.send_query(packet, sender.timeout).await?;
        match response
            .decode_json::<RpcResponse>()
            .map_err(|e| RpcError::Decode(e.to_string()))?
        {
            RpcResponse::Success { value } => {
                serde_json::from_value(value).map_err(|e| RpcError::Decode(e.to_string()))
            }
            RpcResponse::Failure(failure) => Err(RpcError::Remote {
                kind: failure.kind,
                message: failure.message,
            }),
        }
    }

    /// Send the chain without waiting for a result.
    pub fn fire_and_forget(self) -> Result<(), RpcError> {
        let (sender, packet) = self.into_packet(false)?;
        let channel = (sender.supplier)().ok_or_else(|| RpcError::NotConnected(sender.target.clone()))?;
        Ok(channel.send(packet)?)
    }
}
