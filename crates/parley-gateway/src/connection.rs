use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::api::Claims;
use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::commands::{ConnCtx, handle_command};
use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long an unauthenticated connection may wait for its Identify frame.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection through its whole lifecycle:
/// credential handshake, ready + presence replay, command loop, cleanup.
///
/// `transport_token` is the credential carried on the upgrade request
/// (Authorization header or query parameter), if any. When absent, the
/// connection stays unauthenticated until an `Identify` frame arrives;
/// without one inside the timeout it is closed.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
    transport_token: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    // A valid transport credential authenticates immediately; otherwise
    // (absent or invalid) the in-band identify window still applies.
    let identity = match transport_token.and_then(|token| verify_token(&token, &jwt_secret)) {
        Some(id) => Some(id),
        None => wait_for_identify(&mut sender, &mut receiver, &jwt_secret).await,
    };
    let (user_id, username) = match identity {
        Some(id) => id,
        None => {
            // Failed credential: disconnect rather than leave a retriable
            // unauthenticated session around.
            warn!("WebSocket client failed to authenticate, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    // Send Ready event
    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    // Register the connection, replay who is already online, then go
    // online ourselves (broadcasts presence to everyone else).
    let (conn_id, mut conn_rx) = dispatcher.register(user_id, username.clone()).await;

    // Subscribe before taking the presence snapshot: changes broadcast
    // between snapshot and loop start are then buffered, not lost.
    let mut broadcast_rx = dispatcher.subscribe();

    for (uid, uname) in dispatcher.online_users().await {
        let event = GatewayEvent::PresenceOnline {
            user_id: uid,
            username: uname,
        };
        if send_event(&mut sender, &event).await.is_err() {
            dispatcher.disconnect(conn_id).await;
            return;
        }
    }

    dispatcher.user_online(user_id, username.clone()).await;

    // Per-connection joined set, shared between the send task (broadcast
    // filtering) and the recv task (command checks).
    let joined: Arc<std::sync::RwLock<HashSet<i64>>> =
        Arc::new(std::sync::RwLock::new(HashSet::new()));

    let send_joined = joined.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events to the client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let out = match result {
                        Ok(out) => out,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} frames", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    let event = {
                        let rooms = send_joined.read().expect("joined set lock poisoned");
                        out.deliverable(conn_id, &rooms)
                    };
                    if let Some(event) = event {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                }
                result = conn_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client. Handled inline so per-connection
    // command order is preserved.
    let ctx = ConnCtx {
        conn_id,
        user_id,
        username: username.clone(),
        joined,
    };
    let recv_dispatcher = dispatcher.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&recv_dispatcher, &db, &ctx, cmd).await;
                    }
                    Err(e) => {
                        // Closed tag set: unknown or malformed frames are
                        // rejected with a scoped error, never broadcast.
                        let preview: String = text.chars().take(200).collect();
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            ctx.username, ctx.user_id, e, preview
                        );
                        recv_dispatcher
                            .send_to_conn(
                                ctx.conn_id,
                                GatewayEvent::Error {
                                    message: "unrecognized command".into(),
                                },
                            )
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.disconnect(conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    sender.send(Message::Text(text.into())).await
}

/// Verify a bearer token, stripping the `Bearer ` prefix if present.
pub fn verify_token(token: &str, jwt_secret: &str) -> Option<(Uuid, String)> {
    let token = token.strip_prefix("Bearer ").unwrap_or(token);
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    Some((token_data.claims.sub, token_data.claims.username))
}

/// Outcome of one text frame received during the identify window.
#[derive(Debug, PartialEq, Eq)]
enum HandshakeStep {
    Authenticated(Uuid, String),
    BadCredential,
    /// A recognized command other than identify: rejected, the connection
    /// is still unauthenticated
    Unauthorized,
    /// Unparseable noise, skipped
    Ignored,
}

fn handshake_step(text: &str, jwt_secret: &str) -> HandshakeStep {
    match serde_json::from_str::<GatewayCommand>(text) {
        Ok(GatewayCommand::Identify { token }) => match verify_token(&token, jwt_secret) {
            Some((user_id, username)) => HandshakeStep::Authenticated(user_id, username),
            None => HandshakeStep::BadCredential,
        },
        Ok(_) => HandshakeStep::Unauthorized,
        Err(_) => HandshakeStep::Ignored,
    }
}

/// Wait for the in-band `Identify` command carrying the credential. Room
/// and message commands arriving first are answered with an `error` event;
/// without a valid identify inside the timeout the connection closes.
async fn wait_for_identify(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    let deadline = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                match handshake_step(&text, jwt_secret) {
                    HandshakeStep::Authenticated(user_id, username) => {
                        return Some((user_id, username));
                    }
                    HandshakeStep::BadCredential => return None,
                    HandshakeStep::Unauthorized => {
                        let err = GatewayEvent::Error {
                            message: "unauthorized".into(),
                        };
                        if send_event(sender, &err).await.is_err() {
                            return None;
                        }
                    }
                    HandshakeStep::Ignored => {}
                }
            }
        }
        None
    });

    deadline.await.ok().flatten()
}
