//! C8 WebSocket connection pump (spec §4.8).
//!
//! One `actix-ws` session per connection, split into a read task (decodes
//! [`ClientMessage`], updates subscriptions, requests on-demand streams) and
//! a write task (drains the client's [`Hub`] queue, pings on a ticker). The
//! two communicate only through the `Hub`'s mpsc channel and a shared
//! `Session` handle; neither talks to the other directly.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpRequest, HttpResponse};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};
use wirewarden_types::{ChannelName, ClientMessage, ServerMessage};

use crate::identity::{IdentityClient, ResolvedUser};

use super::Hub;

/// How long the server waits for a pong before considering the connection
/// dead, and how long an unauthenticated connection has to send its first
/// message (spec §4.8 "auth handshake", testable property 9).
const PONG_WAIT: Duration = Duration::from_secs(60);
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Supplies the immediate snapshot sent on `stats`/`docker` subscribe
/// (spec §4.8 step 3). Implemented by the status-checker collaborators.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self, channel: ChannelName) -> BoxFuture<'_, Option<Value>>;
}

/// Supplies an on-demand, per-container log byte stream for the
/// `docker_logs` channel (spec §4.8 "8-byte framed stream").
pub trait DockerLogSource: Send + Sync {
    fn stream_logs(&self, container: &str) -> BoxFuture<'_, Result<BoxStream<'static, Vec<u8>>, String>>;
}

/// Upgrade an HTTP request to a WebSocket and spawn its read/write pumps.
/// `url_token` is the legacy `?token=` query parameter; if absent, the first
/// message must be `{"action":"auth","token":"..."}` within [`AUTH_TIMEOUT`]
/// (spec §4.8, scenario S5).
pub async fn handle_connection(
    req: HttpRequest,
    body: web::Payload,
    hub: Arc<Hub>,
    identity: Arc<dyn IdentityClient>,
    snapshots: Arc<dyn SnapshotSource>,
    logs: Arc<dyn DockerLogSource>,
    url_token: Option<String>,
) -> actix_web::Result<HttpResponse> {
    let (response, session, stream) = actix_ws::handle(&req, body)?;

    actix_web::rt::spawn(async move {
        run_connection(session, stream, hub, identity, snapshots, logs, url_token).await;
    });

    Ok(response)
}

async fn run_connection(
    mut session: actix_ws::Session,
    mut stream: actix_ws::MessageStream,
    hub: Arc<Hub>,
    identity: Arc<dyn IdentityClient>,
    snapshots: Arc<dyn SnapshotSource>,
    logs: Arc<dyn DockerLogSource>,
    url_token: Option<String>,
) {
    let user = match url_token {
        Some(token) => identity.validate_token(&token).await.ok(),
        None => authenticate_via_handshake(&mut stream, &identity).await,
    };

    let Some(user) = user else {
        let _ = session.close(None).await;
        return;
    };

    let (client_id, mut outbound) = hub.register();
    hub.send_to(
        client_id,
        ServerMessage::init(serde_json::json!({ "valid": true, "user": user })),
    );

    let mut ping_ticker = tokio::time::interval(PONG_WAIT * 9 / 10);
    ping_ticker.tick().await; // first tick fires immediately; discard it

    let mut log_streams: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = ping_ticker.tick() => {
                if session.ping(b"").await.is_err() {
                    break;
                }
            }
            msg = outbound.recv() => {
                match msg {
                    Some(message) => {
                        if send_json(&mut session, &message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(actix_ws::Message::Text(text))) => {
                        handle_client_message(
                            &text,
                            client_id,
                            &hub,
                            &snapshots,
                            &logs,
                            &mut log_streams,
                        ).await;
                    }
                    Some(Ok(actix_ws::Message::Ping(bytes))) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Some(Ok(actix_ws::Message::Pong(_))) => {}
                    Some(Ok(actix_ws::Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket protocol error");
                        break;
                    }
                }
            }
        }
    }

    for handle in log_streams {
        handle.abort();
    }
    hub.unregister(client_id);
    let _ = session.close(None).await;
}

/// Wait for a single `{"action":"auth","token":"..."}` message, validated
/// against the identity service. Any other first message, or silence past
/// [`AUTH_TIMEOUT`], fails the handshake without registering the client.
async fn authenticate_via_handshake(
    stream: &mut actix_ws::MessageStream,
    identity: &Arc<dyn IdentityClient>,
) -> Option<ResolvedUser> {
    let first = tokio::time::timeout(AUTH_TIMEOUT, stream.next()).await;

    let Ok(Some(Ok(actix_ws::Message::Text(text)))) = first else {
        return None;
    };

    let Ok(ClientMessage::Auth { token }) = serde_json::from_str::<ClientMessage>(&text) else {
        return None;
    };

    identity.validate_token(&token).await.ok()
}

async fn handle_client_message(
    text: &str,
    client_id: super::ClientId,
    hub: &Arc<Hub>,
    snapshots: &Arc<dyn SnapshotSource>,
    logs: &Arc<dyn DockerLogSource>,
    log_streams: &mut Vec<tokio::task::JoinHandle<()>>,
) {
    let Ok(message) = serde_json::from_str::<ClientMessage>(text) else {
        return;
    };

    match message {
        ClientMessage::Subscribe { channels, container } => {
            for raw in channels {
                let Some(channel) = ChannelName::parse(&raw) else { continue };
                hub.subscribe(client_id, channel);

                if matches!(channel, ChannelName::Stats | ChannelName::Docker) {
                    if let Some(payload) = snapshots.snapshot(channel).await {
                        hub.send_to(client_id, ServerMessage::for_channel(channel, payload));
                    }
                }

                if channel == ChannelName::DockerLogs {
                    if let Some(name) = container.clone() {
                        log_streams.push(spawn_log_stream(client_id, name, hub.clone(), logs.clone()));
                    }
                }
            }
        }
        ClientMessage::Unsubscribe { channels, container: _ } => {
            for raw in channels {
                if let Some(channel) = ChannelName::parse(&raw) {
                    hub.unsubscribe(client_id, channel);
                }
            }
        }
        ClientMessage::Auth { .. } | ClientMessage::Other => {}
    }
}

/// Stream a container's logs to one client as framed `docker_logs` messages
/// until the source ends or the task is aborted by a later `unsubscribe`
/// (spec §4.8 "8-byte framed stream").
fn spawn_log_stream(
    client_id: super::ClientId,
    container: String,
    hub: Arc<Hub>,
    logs: Arc<dyn DockerLogSource>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut chunks = match logs.stream_logs(&container).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(container = %container, error = %err, "failed to start docker log stream");
                return;
            }
        };

        while let Some(chunk) = chunks.next().await {
            let payload = serde_json::json!({
                "container": container,
                "data": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &chunk),
            });
            hub.send_to(client_id, ServerMessage::for_channel(ChannelName::DockerLogs, payload));
        }
    })
}

async fn send_json(session: &mut actix_ws::Session, message: &ServerMessage) -> Result<(), ()> {
    let text = serde_json::to_string(message).map_err(|_| ())?;
    session.text(text).await.map_err(|_| ())
}
