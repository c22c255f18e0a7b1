//! Shared backend loss and recovery.

use crate::assertions::{assert_contains_all, assert_converged, ClientSnapshot};
use crate::harness::{Cluster, ClusterConfig, Node, WAIT_TIMEOUT};
use collab_types::DocumentName;
use std::time::Duration;

async fn wait_degraded(node: &Node, degraded: bool) {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while node.gateway.is_degraded() != degraded {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("link state not reached");
}

#[tokio::test]
async fn edits_on_both_sides_converge_after_partition_heals() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    let document = DocumentName::page(1);
    let mut a = cluster.connect(0, &document).await.unwrap();
    let mut b = cluster.connect(1, &document).await.unwrap();

    a.insert("one");
    b.wait_for_text("one").await.unwrap();

    cluster.node(1).partition();
    wait_degraded(cluster.node(1), true).await;

    a.insert(" two");
    b.insert(" three");
    tokio::time::sleep(Duration::from_millis(50)).await;
    b.poll().unwrap();
    assert!(!b.text().contains("two"));

    cluster.node(1).heal();
    wait_degraded(cluster.node(1), false).await;

    a.wait_for("edit from partitioned side", |c| c.text().contains("three"))
        .await
        .unwrap();
    b.wait_for("edit missed during partition", |c| c.text().contains("two"))
        .await
        .unwrap();

    let snapshots = [ClientSnapshot::of(&a), ClientSnapshot::of(&b)];
    for snapshot in &snapshots {
        assert_contains_all(snapshot, &["one", " two", " three"]).assert_passed();
    }
    assert_converged(&snapshots).assert_passed();
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn local_viewers_keep_editing_while_degraded() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    let document = DocumentName::page(2);
    let a = cluster.connect(1, &document).await.unwrap();
    let mut b = cluster.connect(1, &document).await.unwrap();

    cluster.node(1).partition();
    wait_degraded(cluster.node(1), true).await;

    a.insert("still local");
    b.wait_for_text("still local").await.unwrap();
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn connections_accepted_while_degraded() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    cluster.node(0).partition();

    // The failed subscription is what degrades the link.
    let client = cluster.connect(0, &DocumentName::page(3)).await.unwrap();
    assert_eq!(cluster.node(0).gateway.connection_count(), 1);
    wait_degraded(cluster.node(0), true).await;
    client.close().await;
}

#[tokio::test]
async fn documents_opened_while_degraded_join_after_recovery() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    let document = DocumentName::page(4);
    let mut a = cluster.connect(0, &document).await.unwrap();

    cluster.node(1).partition();
    let mut b = cluster.connect(1, &document).await.unwrap();
    wait_degraded(cluster.node(1), true).await;
    b.insert("from b");

    cluster.node(1).heal();
    a.wait_for_text("from b").await.unwrap();

    a.insert(" and a");
    b.wait_for_text("from b and a").await.unwrap();
    a.close().await;
    b.close().await;
}
