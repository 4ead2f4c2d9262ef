//! Channel messages between nodes.

use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{ChannelMessage, ChannelMessageSender, ChannelMessageTarget};
use parking_lot::Mutex;

use crate::harness::{wait_until, TestCluster};

const TIMEOUT: Duration = Duration::from_secs(15);

fn recorder(node: &crate::harness::TestNode) -> Arc<Mutex<Vec<ChannelMessage>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    node.ctx().channel_messages.add(Arc::new(move |message: &ChannelMessage| -> Option<Vec<u8>> {
        if message.channel != "test" {
            return None;
        }
        sink.lock().push(message.clone());
        Some(b"pong".to_vec())
    }));
    seen
}

#[tokio::test]
async fn test_message_reaches_peer() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.wait_full_mesh(TIMEOUT).await.unwrap();
    let seen = recorder(cluster.node("node-2"));

    let message = ChannelMessage::new(ChannelMessageSender::node("node-1"), "test", "hello")
        .target(ChannelMessageTarget::Node("node-2".into()))
        .content(b"hi".to_vec());
    assert_eq!(cluster.node("node-1").ctx().messenger().send(&message), 1);

    wait_until("node-2 to receive hello", TIMEOUT, || !seen.lock().is_empty())
        .await
        .unwrap();
    let received = seen.lock()[0].clone();
    assert_eq!(received.message, "hello");
    assert_eq!(received.content, b"hi");

    cluster.shutdown_all().await;
}

#[tokio::test]
async fn test_all_nodes_includes_sender() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.wait_full_mesh(TIMEOUT).await.unwrap();
    let local = recorder(cluster.node("node-1"));
    let remote = recorder(cluster.node("node-2"));

    let message = ChannelMessage::new(ChannelMessageSender::node("node-1"), "test", "broadcast")
        .target(ChannelMessageTarget::AllNodes);
    cluster.node("node-1").ctx().messenger().send(&message);

    wait_until("both nodes to receive the broadcast", TIMEOUT, || {
        local.lock().len() == 1 && remote.lock().len() == 1
    })
    .await
    .unwrap();

    cluster.shutdown_all().await;
}

#[tokio::test]
async fn test_query_answered_by_peer() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.wait_full_mesh(TIMEOUT).await.unwrap();
    let _seen = recorder(cluster.node("node-2"));

    let message = ChannelMessage::new(ChannelMessageSender::node("node-1"), "test", "ping")
        .target(ChannelMessageTarget::Node("node-2".into()));
    let reply = cluster
        .node("node-1")
        .ctx()
        .messenger()
        .send_and_await_single(&message, Duration::from_secs(5))
        .await;
    assert_eq!(reply.as_deref(), Some(&b"pong"[..]));

    cluster.shutdown_all().await;
}
