//! Graceful drain.

use crate::harness::{decode_state, Client, Cluster, ClusterConfig};
use collab_types::DocumentName;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn drain_closes_viewers_and_flushes_documents() {
    let mut cluster = Cluster::start(ClusterConfig {
        debounce: Duration::from_secs(60),
        ..ClusterConfig::default()
    });
    let document = DocumentName::page(1);
    let mut a = cluster.connect(0, &document).await.unwrap();
    let mut b = cluster.connect(0, &document).await.unwrap();
    let other = cluster.connect(1, &DocumentName::page(2)).await.unwrap();

    a.insert("draft");
    b.wait_for_text("draft").await.unwrap();
    assert!(cluster.storage().snapshot(&document).is_none());

    let gateway = Arc::clone(&cluster.node(0).gateway);
    let drain = tokio::spawn(async move { gateway.drain().await });

    assert_eq!(a.wait_closed().await.unwrap().code, 1001);
    assert_eq!(b.wait_closed().await.unwrap().code, 1001);
    let report = drain.await.unwrap();

    assert_eq!(report.documents, 1);
    assert_eq!(report.closed_connections, 2);
    assert_eq!(report.forced_connections, 0);
    assert_eq!(cluster.node(0).gateway.document_count(), 0);

    let (text, _) = decode_state(&cluster.storage().snapshot(&document).unwrap()).unwrap();
    assert_eq!(text, "draft");

    // The sibling is untouched.
    assert_eq!(cluster.node(1).gateway.connection_count(), 1);
    other.close().await;
}

#[tokio::test]
async fn drained_instance_rejects_new_connections() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    let report = cluster.node(0).gateway.drain().await;
    assert_eq!(report.documents, 0);
    assert!(!cluster.node(0).gateway.is_accepting());

    let mut rejected = Client::open(cluster.node(0), &DocumentName::page(3), "late");
    assert_eq!(rejected.wait_closed().await.unwrap().code, 1001);
    assert_eq!(cluster.node(0).gateway.connection_count(), 0);

    let accepted = cluster.connect(1, &DocumentName::page(3)).await.unwrap();
    accepted.close().await;
}

#[tokio::test(start_paused = true)]
async fn unresponsive_viewers_forced_out_after_grace() {
    let mut cluster = Cluster::start(ClusterConfig {
        grace: Duration::from_secs(2),
        ..ClusterConfig::default()
    });
    let document = DocumentName::page(4);
    let silent = cluster.connect(0, &document).await.unwrap();

    // `silent` never reads its close frame, so it never answers it.
    let report = cluster.node(0).gateway.drain().await;
    assert_eq!(report.closed_connections, 1);
    assert_eq!(report.forced_connections, 1);
    assert!(report.elapsed >= Duration::from_secs(2));
    assert_eq!(cluster.node(0).gateway.connection_count(), 0);
    drop(silent);
}

#[tokio::test]
async fn drain_all_empties_every_instance() {
    let mut cluster = Cluster::start(ClusterConfig {
        instances: 3,
        ..ClusterConfig::default()
    });
    let mut clients = Vec::new();
    for i in 0..3 {
        clients.push(cluster.connect(i, &DocumentName::page(5)).await.unwrap());
    }
    clients[0].insert("shared");
    for client in &mut clients[1..] {
        client.wait_for_text("shared").await.unwrap();
    }

    let answer = tokio::spawn(async move {
        for client in &mut clients {
            let _ = client.wait_closed().await;
        }
        clients
    });
    cluster.drain_all().await;
    answer.await.unwrap();

    for node in cluster.nodes() {
        assert_eq!(node.gateway.document_count(), 0);
    }
    let (text, _) = decode_state(&cluster.storage().snapshot(&DocumentName::page(5)).unwrap()).unwrap();
    assert_eq!(text, "shared");
}
