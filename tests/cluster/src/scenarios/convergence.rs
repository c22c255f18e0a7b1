//! Concurrent edits across instances.

use crate::assertions::{assert_contains_all, assert_converged, assert_delivered_exactly, ClientSnapshot};
use crate::harness::{Cluster, ClusterConfig};
use collab_types::DocumentName;
use std::time::Duration;

#[tokio::test]
async fn edits_reach_viewers_on_other_instance() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    let document = DocumentName::page(1);
    let mut a = cluster.connect(0, &document).await.unwrap();
    let mut b = cluster.connect(1, &document).await.unwrap();

    a.insert("hello ");
    b.wait_for_text("hello ").await.unwrap();

    b.insert("world");
    a.wait_for_text("hello world").await.unwrap();

    assert_converged(&[ClientSnapshot::of(&a), ClientSnapshot::of(&b)]).assert_passed();
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn five_clients_on_three_instances_converge() {
    let mut cluster = Cluster::start(ClusterConfig {
        instances: 3,
        ..ClusterConfig::default()
    });
    let document = DocumentName::page(2);
    let mut clients = Vec::new();
    for i in 0..5 {
        clients.push(cluster.connect(i % 3, &document).await.unwrap());
    }

    let fragments: Vec<String> = (0..5).map(|i| format!("[edit-{i}]")).collect();
    for (client, fragment) in clients.iter().zip(&fragments) {
        client.insert(fragment);
    }

    let expected: Vec<&str> = fragments.iter().map(String::as_str).collect();
    for client in &mut clients {
        client
            .wait_for("all edits", |c| expected.iter().all(|f| c.text().contains(f)))
            .await
            .unwrap();
    }

    let snapshots: Vec<_> = clients.iter().map(ClientSnapshot::of).collect();
    for snapshot in &snapshots {
        assert_contains_all(snapshot, &expected).assert_passed();
    }
    assert_converged(&snapshots).assert_passed();
    for client in clients {
        client.close().await;
    }
}

#[tokio::test]
async fn late_joiner_on_other_instance_catches_up() {
    let mut cluster = Cluster::start(ClusterConfig {
        debounce: Duration::from_secs(60),
        ..ClusterConfig::default()
    });
    let document = DocumentName::page(3);
    let a = cluster.connect(0, &document).await.unwrap();
    a.insert("written before b arrived");

    // Nothing is flushed yet, so b can only learn the text from node 0.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cluster.storage().snapshot(&document).is_none());

    let mut b = cluster.connect(1, &document).await.unwrap();
    b.wait_for_text("written before b arrived").await.unwrap();
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn each_update_delivered_once() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    let document = DocumentName::page(4);
    let mut a = cluster.connect(0, &document).await.unwrap();
    let mut b = cluster.connect(1, &document).await.unwrap();
    let mut c = cluster.connect(1, &document).await.unwrap();

    // Let the join-time state exchange settle.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for client in [&mut a, &mut b, &mut c] {
        client.poll().unwrap();
    }
    let before: Vec<usize> = [&a, &b, &c].iter().map(|c| c.updates_received()).collect();

    a.insert("x");
    b.wait_for_text("x").await.unwrap();
    c.wait_for_text("x").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    for client in [&mut a, &mut b, &mut c] {
        client.poll().unwrap();
    }

    assert_delivered_exactly(&ClientSnapshot::of(&a), before[0]).assert_passed();
    assert_delivered_exactly(&ClientSnapshot::of(&b), before[1] + 1).assert_passed();
    assert_delivered_exactly(&ClientSnapshot::of(&c), before[2] + 1).assert_passed();
    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn standalone_instances_stay_isolated() {
    let mut cluster = Cluster::start(ClusterConfig {
        sync: false,
        ..ClusterConfig::default()
    });
    let document = DocumentName::page(5);
    let a = cluster.connect(0, &document).await.unwrap();
    let mut b = cluster.connect(1, &document).await.unwrap();

    a.insert("local only");
    tokio::time::sleep(Duration::from_millis(100)).await;
    b.poll().unwrap();
    assert_eq!(b.text(), "");
    assert_eq!(cluster.hub().published_count(), 0);
    a.close().await;
    b.close().await;
}
