//! Service factory RPC, service snapshot replication and service auth.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use fleet_network::TransportSecurity;
use fleet_node::auth::AuthError;
use fleet_node::services::ServiceFactoryClient;
use fleet_node::wrapper::ServiceConnection;
use fleet_protocol::{
    ChannelMessage, ChannelMessageSender, ChannelMessageTarget, ServiceConfiguration,
    ServiceLifecycle,
};
use parking_lot::Mutex;

use crate::harness::{wait_until, TestCluster};

const TIMEOUT: Duration = Duration::from_secs(15);

fn config(task: &str) -> ServiceConfiguration {
    ServiceConfiguration {
        task_name: task.into(),
        groups: vec!["global".into()],
        task_service_id: None,
        properties: BTreeMap::new(),
    }
}

/// node-1 creates and starts a service on node-2 through chained RPC calls;
/// the tick loop applies the start and both nodes see it running.
#[tokio::test]
async fn test_remote_factory_create_and_start() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.wait_full_mesh(TIMEOUT).await.unwrap();
    let node_1 = cluster.node("node-1");
    let node_2 = cluster.node("node-2");

    let server = node_1.ctx().provider.node("node-2").unwrap();
    let factory = ServiceFactoryClient::new(server.service_factory());

    let created = factory.create(&config("lobby")).await.unwrap();
    assert_eq!(created.service_id.node_unique_id, "node-2");
    assert_eq!(created.service_id.name(), "lobby-1");
    assert_eq!(created.lifecycle, ServiceLifecycle::Prepared);
    let id = created.service_id.unique_id;

    factory.start(id).unwrap();
    wait_until("node-2 to run lobby-1", TIMEOUT, || {
        node_2
            .ctx()
            .local_services
            .get(&id)
            .is_some_and(|s| s.lifecycle == ServiceLifecycle::Running)
    })
    .await
    .unwrap();
    wait_until("node-1 to see lobby-1 running", TIMEOUT, || {
        node_1
            .ctx()
            .services
            .get(&id)
            .is_some_and(|s| s.lifecycle == ServiceLifecycle::Running)
    })
    .await
    .unwrap();

    let info = factory.info(id).await.unwrap().unwrap();
    assert_eq!(info.lifecycle, ServiceLifecycle::Running);

    // The ordinal is taken cluster-wide now.
    let back = node_2.ctx().provider.node("node-1").unwrap();
    let second = ServiceFactoryClient::new(back.service_factory())
        .create(&config("lobby"))
        .await
        .unwrap();
    assert_eq!(second.service_id.name(), "lobby-2");
    assert_eq!(second.service_id.node_unique_id, "node-1");

    // Lifecycle calls do not wait for the provider; an unknown id only
    // fails over there. Calls that return a value still report it.
    factory.start(uuid::Uuid::new_v4()).unwrap();
    assert!(factory.info(uuid::Uuid::new_v4()).await.is_err());

    cluster.shutdown_all().await;
}

#[tokio::test]
async fn test_create_rejected_while_draining() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.wait_full_mesh(TIMEOUT).await.unwrap();

    fleet_node::internal::change_draining_state(cluster.node("node-1").ctx(), "node-2", true);
    wait_until("node-2 to drain", TIMEOUT, || cluster.node("node-2").ctx().is_draining())
        .await
        .unwrap();

    let server = cluster.node("node-1").ctx().provider.node("node-2").unwrap();
    let factory = ServiceFactoryClient::new(server.service_factory());
    assert!(factory.create(&config("lobby")).await.is_err());

    cluster.shutdown_all().await;
}

/// A service authenticates with its secret, shows up as connected on the
/// peer and can reach the peer's message bus through its node.
#[tokio::test]
async fn test_service_connection() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.wait_full_mesh(TIMEOUT).await.unwrap();
    let node_1 = cluster.node("node-1");
    let node_2 = cluster.node("node-2");

    let (snapshot, secret) = node_1
        .ctx()
        .local_services
        .create(config("proxy"), &BTreeSet::new())
        .unwrap();
    let id = snapshot.service_id.unique_id;

    let wrong = ServiceConnection::connect(
        node_1.addr(),
        &TransportSecurity::Plain,
        snapshot.service_id.clone(),
        "not-the-secret",
    )
    .await;
    assert!(matches!(wrong, Err(AuthError::Rejected)));

    let service = ServiceConnection::connect(
        node_1.addr(),
        &TransportSecurity::Plain,
        snapshot.service_id.clone(),
        &secret,
    )
    .await
    .unwrap();
    assert_eq!(service.service_id().name(), "proxy-1");

    wait_until("node-2 to see proxy-1 connected", TIMEOUT, || {
        node_2.ctx().services.get(&id).is_some_and(|s| s.connected)
    })
    .await
    .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    node_2.ctx().channel_messages.add(Arc::new(move |message: &ChannelMessage| -> Option<Vec<u8>> {
        if message.channel == "test" {
            sink.lock().push(message.message.clone());
        }
        None
    }));

    let message = ChannelMessage::new(
        ChannelMessageSender::service(snapshot.service_id.name()),
        "test",
        "from-proxy",
    )
    .target(ChannelMessageTarget::Node("node-2".into()));
    service.send_message(&message).unwrap();
    wait_until("node-2 to receive from-proxy", TIMEOUT, || {
        seen.lock().iter().any(|m| m == "from-proxy")
    })
    .await
    .unwrap();

    // Messages addressed to the service reach it through its node.
    let inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    service.messages().add(Arc::new(move |message: &ChannelMessage| -> Option<Vec<u8>> {
        sink.lock().push(message.message.clone());
        None
    }));
    let to_service = ChannelMessage::new(ChannelMessageSender::node("node-2"), "test", "to-proxy")
        .target(ChannelMessageTarget::Service("proxy-1".into()));
    node_2.ctx().messenger().send(&to_service);
    wait_until("proxy-1 to receive to-proxy", TIMEOUT, || {
        inbox.lock().iter().any(|m| m == "to-proxy")
    })
    .await
    .unwrap();

    service.close();
    wait_until("node-2 to see proxy-1 disconnected", TIMEOUT, || {
        node_2.ctx().services.get(&id).is_some_and(|s| !s.connected)
    })
    .await
    .unwrap();

    cluster.shutdown_all().await;
}
