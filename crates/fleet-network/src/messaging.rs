//! Channel message subscribers.
//!
//! Subscribers form an ordered list and are invoked synchronously in
//! registration order; each one filters by channel and message name itself.
//! Cluster-wide routing (which nodes and services receive a message) lives in
//! the node, this module only covers local delivery and the packet glue.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{
    tags, ChannelMessage, ChannelMessageReply, Packet, ProtocolError, INTERNAL_PACKET_ID,
};
use parking_lot::RwLock;

use crate::channel::Channel;
use crate::registry::{ListenerResult, PacketListener};
use crate::QueryError;

/// Receives channel messages delivered to this process.
pub trait ChannelMessageListener: Send + Sync {
    /// Handle a message. Returning content answers a message sent as a query;
    /// the first listener to answer wins.
    fn handle(&self, message: &ChannelMessage) -> Option<Vec<u8>>;
}

impl<F> ChannelMessageListener for F
where
    F: Fn(&ChannelMessage) -> Option<Vec<u8>> + Send + Sync,
{
    fn handle(&self, message: &ChannelMessage) -> Option<Vec<u8>> {
        self(message)
    }
}

/// Ordered subscriber list.
#[derive(Clone, Default)]
pub struct ChannelMessageListeners {
    inner: Arc<RwLock<Vec<Arc<dyn ChannelMessageListener>>>>,
}

impl ChannelMessageListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ChannelMessageListener>) {
        self.inner.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Invoke every subscriber in order. Returns the first reply.
    pub fn deliver(&self, message: &ChannelMessage) -> Option<Vec<u8>> {
        let listeners = self.inner.read().clone();
        let mut reply = None;
        for listener in &listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.handle(message))) {
                Ok(Some(content)) if reply.is_none() => reply = Some(content),
                Ok(_) => {}
                Err(_) => {
                    tracing::error!(
                        channel = %message.channel,
                        message = %message.message,
                        "channel message listener panicked"
                    );
                }
            }
        }
        reply
    }
}

/// Delivers inbound channel-message packets to local subscribers and answers
/// queries. Used by processes that do no routing of their own.
impl PacketListener for ChannelMessageListeners {
    fn handle(&self, channel: &Channel, packet: &Packet) -> ListenerResult {
        let message: ChannelMessage = packet.decode_json()?;
        let reply = self.deliver(&message);
        if packet.is_query() {
            channel.send(reply_packet(packet, reply)?)?;
        }
        Ok(())
    }
}

/// Packet carrying `message`.
pub fn message_packet(message: &ChannelMessage) -> Result<Packet, ProtocolError> {
    Packet::json(tags::CHANNEL_MESSAGE, INTERNAL_PACKET_ID, message)
}

/// Response packet answering a channel-message query.
pub fn reply_packet(request: &Packet, content: Option<Vec<u8>>) -> Result<Packet, ProtocolError> {
    Packet::json_response_to(request, &ChannelMessageReply { content })
}

/// Send `message` over `channel` as a query and return the reply content.
pub async fn query_message(
    channel: &Channel,
    message: &ChannelMessage,
    timeout: Duration,
) -> Result<Option<Vec<u8>>, QueryError> {
    let packet = message_packet(message).map_err(crate::ChannelError::from)?;
    let response = channel.send_query(packet, timeout).await?;
    let reply: ChannelMessageReply = response
        .decode_json()
        .map_err(crate::ChannelError::from)?;
    Ok(reply.content)
}
