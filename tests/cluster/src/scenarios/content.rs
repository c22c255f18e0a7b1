//! Server-side content replacement and custom events.

use crate::assertions::{assert_converged, ClientSnapshot};
use crate::harness::{decode_state, Cluster, ClusterConfig};
use collab_server::coordinator::FORCE_RELOAD_CLOSE_CODE;
use collab_types::{CustomEvent, DocumentName};
use serde_json::json;

fn paragraph(text: &str) -> serde_json::Value {
    json!({
        "type": "doc",
        "content": [
            { "type": "paragraph", "content": [{ "type": "text", "text": text }] }
        ]
    })
}

#[tokio::test]
async fn page_42_replace_before_and_after_a_viewer_joins() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    let document = DocumentName::page(42);
    let gateway = std::sync::Arc::clone(&cluster.node(0).gateway);
    let empty = json!({ "type": "doc", "content": [] });

    assert!(!gateway.replace_document_content(&document, &empty).await.unwrap());
    assert_eq!(gateway.document_count(), 0);

    let mut viewer = cluster.connect(0, &document).await.unwrap();
    assert!(gateway
        .replace_document_content(&document, &paragraph("Fresh"))
        .await
        .unwrap());
    viewer
        .wait_for("replaced content", |c| c.content_xml() == "<paragraph>Fresh</paragraph>")
        .await
        .unwrap();
    viewer.close().await;
}

#[tokio::test]
async fn replacement_reaches_viewers_on_every_instance() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    let document = DocumentName::page(42);
    let mut a = cluster.connect(0, &document).await.unwrap();
    let mut b = cluster.connect(1, &document).await.unwrap();

    let live = cluster
        .node(0)
        .gateway
        .replace_document_content(&document, &paragraph("Hello"))
        .await
        .unwrap();
    assert!(live);

    for client in [&mut a, &mut b] {
        client
            .wait_for("first content", |c| c.content_xml() == "<paragraph>Hello</paragraph>")
            .await
            .unwrap();
    }

    cluster
        .node(1)
        .gateway
        .replace_document_content(&document, &paragraph("Replaced"))
        .await
        .unwrap();
    for client in [&mut a, &mut b] {
        client
            .wait_for("second content", |c| {
                c.content_xml() == "<paragraph>Replaced</paragraph>"
            })
            .await
            .unwrap();
    }

    assert_converged(&[ClientSnapshot::of(&a), ClientSnapshot::of(&b)]).assert_passed();
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn replacement_without_viewers_is_a_no_op() {
    let cluster = Cluster::start(ClusterConfig::default());
    let document = DocumentName::page(43);
    let live = cluster
        .node(0)
        .gateway
        .replace_document_content(&document, &paragraph("ignored"))
        .await
        .unwrap();
    assert!(!live);
    assert!(cluster.storage().snapshot(&document).is_none());
}

#[tokio::test]
async fn replace_or_store_updates_unloaded_document() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    let document = DocumentName::page(44);

    let live = cluster
        .node(0)
        .gateway
        .replace_or_store(&document, &paragraph("Stored"))
        .await
        .unwrap();
    assert!(!live);
    assert_eq!(cluster.node(0).gateway.document_count(), 0);

    let state = cluster.storage().snapshot(&document).unwrap();
    let (_, content) = decode_state(&state).unwrap();
    assert_eq!(content, "<paragraph>Stored</paragraph>");

    let b = cluster.connect(1, &document).await.unwrap();
    assert_eq!(b.content_xml(), "<paragraph>Stored</paragraph>");
    b.close().await;
}

#[tokio::test]
async fn invalid_content_leaves_document_untouched() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    let document = DocumentName::page(45);
    let mut a = cluster.connect(0, &document).await.unwrap();
    cluster
        .node(0)
        .gateway
        .replace_document_content(&document, &paragraph("Kept"))
        .await
        .unwrap();
    a.wait_for("content", |c| c.content_xml() == "<paragraph>Kept</paragraph>")
        .await
        .unwrap();

    let result = cluster
        .node(0)
        .gateway
        .replace_document_content(&document, &json!({ "type": "paragraph" }))
        .await;
    assert!(result.is_err());
    assert_eq!(
        cluster.node(0).gateway.engine().read_content(&document).as_deref(),
        Some("<paragraph>Kept</paragraph>")
    );
    a.close().await;
}

#[tokio::test]
async fn force_reload_closes_viewers_everywhere() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    let document = DocumentName::page(46);
    let mut a = cluster.connect(0, &document).await.unwrap();
    let mut b = cluster.connect(1, &document).await.unwrap();
    let mut other = cluster.connect(1, &DocumentName::page(47)).await.unwrap();

    cluster
        .node(0)
        .gateway
        .handle_event(
            &document,
            CustomEvent::ForceReload {
                reason: Some("schema changed".into()),
            },
        )
        .await
        .unwrap();

    assert_eq!(a.wait_closed().await.unwrap().code, FORCE_RELOAD_CLOSE_CODE);
    assert_eq!(b.wait_closed().await.unwrap().code, FORCE_RELOAD_CLOSE_CODE);

    other.poll().unwrap();
    assert!(other.close_reason().is_none());
    other.close().await;
}

#[tokio::test]
async fn stateless_payload_reaches_every_viewer() {
    let mut cluster = Cluster::start(ClusterConfig::default());
    let document = DocumentName::page(48);
    let mut a = cluster.connect(0, &document).await.unwrap();
    let mut b = cluster.connect(1, &document).await.unwrap();

    cluster
        .node(1)
        .gateway
        .handle_event(
            &document,
            CustomEvent::Stateless {
                payload: r#"{"kind":"comment-added"}"#.into(),
            },
        )
        .await
        .unwrap();

    for client in [&mut a, &mut b] {
        client
            .wait_for("stateless payload", |c| !c.stateless().is_empty())
            .await
            .unwrap();
        assert_eq!(client.stateless(), [r#"{"kind":"comment-added"}"#.to_string()]);
    }
    a.close().await;
    b.close().await;
}
