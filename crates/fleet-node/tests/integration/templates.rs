//! Template deployment to a peer over a chunked transfer.

use std::time::Duration;

use fleet_node::template_deploy::{deploy_template, TemplateDeployHeader};
use fleet_storage::ServiceTemplate;

use crate::harness::{wait_until, TestCluster};

const TIMEOUT: Duration = Duration::from_secs(15);

fn tar_with(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *body).unwrap();
    }
    builder.into_inner().unwrap()
}

#[tokio::test]
async fn test_deploy_template_to_peer() {
    let cluster = TestCluster::start(2).await.unwrap();
    cluster.wait_full_mesh(TIMEOUT).await.unwrap();

    let channel = cluster
        .node("node-1")
        .ctx()
        .provider
        .node("node-2")
        .unwrap()
        .channel()
        .unwrap();
    let template = ServiceTemplate::new("lobby", "default");

    // Larger than one chunk so the transfer spans several packets.
    let big = vec![7u8; 300 * 1024];
    let archive = tar_with(&[("server.properties", b"motd=hi"), ("world/region.dat", &big)]);
    let status = deploy_template(
        channel.clone(),
        &TemplateDeployHeader::new(template.clone(), false),
        std::io::Cursor::new(archive.clone()),
        Some(archive.len() as u64),
    )
    .await
    .unwrap();
    assert_eq!(status.bytes, archive.len() as u64);
    assert!(status.chunks > 1);

    let storage = cluster.node("node-2").ctx().templates.local().unwrap();
    wait_until("node-2 to unpack the template", TIMEOUT, || {
        storage.list_files(&template).unwrap_or_default()
            == vec!["server.properties".to_string(), "world/region.dat".to_string()]
    })
    .await
    .unwrap();

    // Overwrite replaces the old contents.
    let replacement = tar_with(&[("plugins/a.jar", b"jar")]);
    deploy_template(
        channel,
        &TemplateDeployHeader::new(template.clone(), true),
        std::io::Cursor::new(replacement),
        None,
    )
    .await
    .unwrap();
    wait_until("node-2 to replace the template", TIMEOUT, || {
        storage.list_files(&template).unwrap_or_default() == vec!["plugins/a.jar".to_string()]
    })
    .await
    .unwrap();
    assert!(!cluster.node("node-2").ctx().tick_gate.is_paused());

    cluster.shutdown_all().await;
}
