//! Bridges one axum websocket to the hub.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt};
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::hub::{BootstrapSource, BroadcastHub, Outbound};
use crate::models::WsClientMessage;

/// Every outbound frame must be accepted within `send_timeout`, otherwise the peer is
/// considered stalled and the socket is closed.
pub async fn serve_socket(
    mut socket: WebSocket,
    hub: Arc<BroadcastHub>,
    source: Arc<dyn BootstrapSource>,
    grace: Duration,
    send_timeout: Duration,
) {
    let mut subscription = hub.connect(source.as_ref());
    let id = subscription.id;

    for text in subscription.snapshot.drain(..) {
        if !send_within(&mut socket, Message::Text(text.to_string()), send_timeout).await {
            debug!(subscriber = %id, "bootstrap send failed");
            hub.disconnect(id);
            return;
        }
    }
    let constants = hub.schedule_constants(id, source, grace);

    loop {
        tokio::select! {
            outbound = subscription.rx.recv() => {
                let frame = match outbound {
                    Some(Outbound::Text(text)) => Message::Text(text.to_string()),
                    Some(Outbound::Ping) => Message::Ping(Vec::new()),
                    Some(Outbound::Close) => {
                        let _ = send_within(&mut socket, Message::Close(None), send_timeout).await;
                        break;
                    }
                    // Removed from the hub
                    None => break,
                };
                if !send_within(&mut socket, frame, send_timeout).await {
                    debug!(subscriber = %id, "send failed or stalled, closing");
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Pong(_))) => hub.mark_alive(id),
                    Some(Ok(Message::Text(text))) => {
                        hub.mark_alive(id);
                        match serde_json::from_str::<WsClientMessage>(&text) {
                            Ok(WsClientMessage::Ping { timestamp }) => {
                                let pong = serde_json::json!({
                                    "type": "pong",
                                    "timestamp": timestamp.unwrap_or(0),
                                });
                                if !send_within(&mut socket, Message::Text(pong.to_string()), send_timeout).await {
                                    break;
                                }
                            }
                            Ok(WsClientMessage::Hello { message }) => {
                                debug!(subscriber = %id, message = ?message, "client hello");
                            }
                            Err(e) => warn!(subscriber = %id, error = %e, "ignoring malformed client message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(subscriber = %id, error = %e, "socket error");
                        break;
                    }
                }
            }
        }
    }

    constants.abort();
    hub.disconnect(id);
}

/// False when the sink errors or does not take the frame in time.
async fn send_within<S>(sink: &mut S, frame: Message, limit: Duration) -> bool
where
    S: Sink<Message> + Unpin,
{
    matches!(timeout(limit, sink.send(frame)).await, Ok(Ok(())))
}
