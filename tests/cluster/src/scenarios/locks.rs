//! Distributed document locks. Run on a paused clock.

use crate::harness::{Cluster, ClusterConfig};
use collab_server::coordinator::LockState;
use collab_server::error::LockError;
use collab_types::DocumentName;
use std::time::Duration;

fn config() -> ClusterConfig {
    ClusterConfig {
        lock_ttl: Duration::from_secs(3),
        lock_renew: Duration::from_secs(1),
        ..ClusterConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn lock_is_exclusive_across_instances() {
    let cluster = Cluster::start(config());
    let document = DocumentName::page(1);

    let watch = cluster.node(0).gateway.lock_document(&document).await.unwrap();
    assert!(watch.is_held());

    let contended = cluster.node(1).gateway.lock_document(&document).await;
    assert!(matches!(contended, Err(LockError::Busy { .. })));

    cluster.node(0).gateway.release_lock(&document).await.unwrap();
    let watch = cluster.node(1).gateway.lock_document(&document).await.unwrap();
    assert!(watch.is_held());
}

#[tokio::test(start_paused = true)]
async fn held_lock_outlives_its_ttl_while_renewed() {
    let cluster = Cluster::start(config());
    let document = DocumentName::page(2);
    let watch = cluster.node(0).gateway.lock_document(&document).await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(watch.state(), LockState::Held);
    assert!(matches!(
        cluster.node(1).gateway.lock_document(&document).await,
        Err(LockError::Busy { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn partitioned_holder_loses_lock_to_sibling() {
    let cluster = Cluster::start(config());
    let document = DocumentName::page(3);
    let mut watch = cluster.node(0).gateway.lock_document(&document).await.unwrap();

    cluster.node(0).partition();
    tokio::time::timeout(Duration::from_secs(10), watch.lost())
        .await
        .expect("lock not reported lost");
    assert_eq!(watch.state(), LockState::Lost);

    // The lease lapsed in the hub, so the sibling can take over.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let taken = cluster.node(1).gateway.lock_document(&document).await.unwrap();
    assert!(taken.is_held());

    cluster.node(0).heal();
    assert!(matches!(
        cluster.node(0).gateway.release_lock(&document).await,
        Err(LockError::Expired { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn second_lock_on_same_instance_rejected() {
    let cluster = Cluster::start(config());
    let document = DocumentName::page(4);
    let _watch = cluster.node(0).gateway.lock_document(&document).await.unwrap();
    assert!(matches!(
        cluster.node(0).gateway.lock_document(&document).await,
        Err(LockError::AlreadyHeld { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn replace_or_store_fails_while_sibling_holds_lock() {
    let cluster = Cluster::start(config());
    let document = DocumentName::page(5);
    let _watch = cluster.node(1).gateway.lock_document(&document).await.unwrap();

    let content = serde_json::json!({ "type": "doc", "content": [] });
    let result = cluster.node(0).gateway.replace_or_store(&document, &content).await;
    assert!(result.is_err());
    assert!(cluster.storage().snapshot(&document).is_none());
}
