//! WebSocket glue: turns an upgraded axum socket into a [`RawConnection`].

use crate::adapter::{CloseReason, OutboundFrame, RawConnection, SocketEvent};
use crate::gateway::CollabGateway;
use crate::handshake::HandshakeRequest;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, OriginalUri};
use axum::http::header::{SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL};
use axum::http::{HeaderMap, HeaderName};
use axum::response::Response;
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Upgrade handler for `{prefix}/:document`.
pub async fn ws_handler(
    Extension(gateway): Extension<Arc<CollabGateway>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let header = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let request = HandshakeRequest {
        method: "GET".to_string(),
        url: uri.to_string(),
        websocket_key: header(SEC_WEBSOCKET_KEY),
        websocket_protocol: header(SEC_WEBSOCKET_PROTOCOL),
        remote_address: connect_info.map(|ConnectInfo(addr)| addr),
    };
    ws.on_upgrade(move |socket| bridge(gateway, socket, request))
}

async fn bridge(gateway: Arc<CollabGateway>, socket: WebSocket, request: HandshakeRequest) {
    let (raw, transport) = RawConnection::pair();
    let (events, mut frames) = transport.into_parts();
    let (mut sink, mut stream) = socket.split();

    // Ends once every outbound sender is gone or after sending a close.
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let (message, closing) = match frame {
                OutboundFrame::Binary(bytes) => (Message::Binary(bytes), false),
                OutboundFrame::Ping(payload) => (Message::Ping(payload), false),
                OutboundFrame::Close(reason) => (
                    Message::Close(Some(CloseFrame {
                        code: reason.code,
                        reason: reason.reason.into(),
                    })),
                    true,
                ),
            };
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    // Dropping `events` without a close frame reads as an abnormal close.
    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let event = match message {
                Ok(Message::Binary(bytes)) => SocketEvent::Message(bytes),
                Ok(Message::Pong(payload)) => SocketEvent::Pong(payload),
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|frame| CloseReason::new(frame.code, frame.reason.into_owned()))
                        .unwrap_or_else(CloseReason::normal);
                    let _ = events.send(SocketEvent::Close(reason));
                    break;
                }
                // Pings are answered by the socket; the protocol is binary only.
                Ok(Message::Ping(_)) | Ok(Message::Text(_)) => continue,
                Err(e) => {
                    debug!(error = %e, "WebSocket read failed");
                    break;
                }
            };
            if events.send(event).is_err() {
                break;
            }
        }
    });

    gateway.serve_connection(raw, request).await;
    reader.abort();
}
