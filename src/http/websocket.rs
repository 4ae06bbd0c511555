//! WebSocket relay.
//!
//! # Responsibilities
//! - Validate the upgrade (origin policy, buffer sizes)
//! - Dial the backend once the client is upgraded
//! - Relay frames in both directions until either side ends
//!
//! # Data Flow
//! ```text
//! Client ←──── frames ────→ Gateway ←──── frames ────→ Backend
//!            client→backend pump
//!            backend→client pump
//! ```
//!
//! # Design Decisions
//! - One task per direction, owned by a `JoinSet` the session awaits
//! - The first direction to stop fires a shared `watch` signal; the other
//!   observes it and stops, so no task outlives the session
//! - Close frames are forwarded, then end the direction that carried them
//! - Closing a destination is bounded by `CLOSE_TIMEOUT`

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{
            close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        State,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::{connect_async, tungstenite};

use crate::config::schema::{Backend, WebSocketPolicy};
use crate::net::connection::{SessionId, SessionTracker};
use crate::observability::metrics;

/// Upper bound on a close handshake with either peer.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler state for one WebSocket endpoint.
pub struct WebSocketRoute {
    backend: Backend,
    policy: WebSocketPolicy,
    sessions: SessionTracker,
}

impl WebSocketRoute {
    pub fn new(backend: Backend, policy: WebSocketPolicy, sessions: SessionTracker) -> Self {
        Self {
            backend,
            policy,
            sessions,
        }
    }
}

/// Axum handler: check the upgrade, then hand the socket to a session.
pub async fn upgrade(
    State(route): State<Arc<WebSocketRoute>>,
    headers: HeaderMap,
    uri: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let mut upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            tracing::warn!(phase = "upgrade", error = %rejection, "Rejected WebSocket upgrade");
            return rejection.into_response();
        }
    };

    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !route.policy.allows_origin(origin) {
        tracing::warn!(phase = "upgrade", origin, "WebSocket origin not allowed");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    if route.policy.read_buffer_size > 0 {
        upgrade = upgrade.read_buffer_size(route.policy.read_buffer_size);
    }
    if route.policy.write_buffer_size > 0 {
        upgrade = upgrade.write_buffer_size(route.policy.write_buffer_size);
    }

    let url = route.backend.resolve_url(uri.path());
    upgrade
        .on_failed_upgrade(|e| {
            tracing::error!(phase = "upgrade", error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| session(route, socket, url))
}

/// Own one relayed session from dial to teardown.
async fn session(route: Arc<WebSocketRoute>, mut client: WebSocket, url: String) {
    let guard = route.sessions.track();
    let id = guard.id();

    let backend = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            tracing::error!(phase = "dial", session_id = %id, backend = %url, error = %e, "Failed to connect to backend WebSocket");
            metrics::record_upstream_error("dial");
            let frame = CloseFrame {
                code: close_code::ERROR,
                reason: "backend unavailable".into(),
            };
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, client.send(Message::Close(Some(frame)))).await;
            return;
        }
    };
    tracing::info!(session_id = %id, backend = %url, "WebSocket session established");

    let (client_tx, client_rx) = client.split();
    let (backend_tx, backend_rx) = backend.split();
    let (done, _) = watch::channel(false);
    let done = Arc::new(done);

    let mut tasks = JoinSet::new();
    tasks.spawn(pump("client->backend", id, client_rx, backend_tx, done.clone()));
    tasks.spawn(pump("backend->client", id, backend_rx, client_tx, done.clone()));

    // Whichever direction ends first stops the other.
    while let Some(result) = tasks.join_next().await {
        done.send_replace(true);
        if let Err(e) = result {
            tracing::error!(session_id = %id, error = %e, "WebSocket relay task failed");
        }
    }

    tracing::info!(session_id = %id, "WebSocket session closed");
    drop(guard);
}

/// A message that can cross to the other side of the relay.
trait RelayFrame: Sized {
    type Peer;

    fn is_close(&self) -> bool;

    /// Convert for the opposite connection; `None` means nothing to forward.
    fn relay(self) -> Option<Self::Peer>;
}

impl RelayFrame for Message {
    type Peer = tungstenite::Message;

    fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }

    fn relay(self) -> Option<tungstenite::Message> {
        Some(match self {
            Message::Text(text) => tungstenite::Message::Text(text.as_str().into()),
            Message::Binary(data) => tungstenite::Message::Binary(data),
            Message::Ping(data) => tungstenite::Message::Ping(data),
            Message::Pong(data) => tungstenite::Message::Pong(data),
            Message::Close(frame) => {
                tungstenite::Message::Close(frame.map(|f| tungstenite::protocol::CloseFrame {
                    code: f.code.into(),
                    reason: f.reason.as_str().into(),
                }))
            }
        })
    }
}

impl RelayFrame for tungstenite::Message {
    type Peer = Message;

    fn is_close(&self) -> bool {
        matches!(self, tungstenite::Message::Close(_))
    }

    fn relay(self) -> Option<Message> {
        Some(match self {
            tungstenite::Message::Text(text) => Message::Text(text.as_str().into()),
            tungstenite::Message::Binary(data) => Message::Binary(data),
            tungstenite::Message::Ping(data) => Message::Ping(data),
            tungstenite::Message::Pong(data) => Message::Pong(data),
            tungstenite::Message::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
                code: f.code.into(),
                reason: f.reason.as_str().into(),
            })),
            // Raw frames only appear when writing; never read.
            tungstenite::Message::Frame(_) => return None,
        })
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|done| *done).await;
}

/// Copy messages from `source` to `sink` until either fails, a close frame
/// has been forwarded, or the session's done signal fires.
async fn pump<St, Si, M, E>(
    direction: &'static str,
    session: SessionId,
    mut source: St,
    mut sink: Si,
    done: Arc<watch::Sender<bool>>,
) where
    St: Stream<Item = Result<M, E>> + Unpin,
    E: Display,
    M: RelayFrame,
    Si: Sink<M::Peer> + Unpin,
    Si::Error: Display,
{
    let mut stop = done.subscribe();
    let mut forwarded = 0u64;

    loop {
        let message = tokio::select! {
            _ = stopped(&mut stop) => break,
            next = source.next() => match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    tracing::debug!(direction, session_id = %session, error = %e, "Read failed");
                    break;
                }
                None => {
                    tracing::debug!(direction, session_id = %session, "Stream ended");
                    break;
                }
            },
        };

        let close = message.is_close();
        let Some(outbound) = message.relay() else {
            continue;
        };

        tokio::select! {
            _ = stopped(&mut stop) => break,
            sent = sink.send(outbound) => {
                if let Err(e) = sent {
                    tracing::debug!(direction, session_id = %session, error = %e, "Write failed");
                    break;
                }
            }
        }
        forwarded += 1;

        if close {
            tracing::debug!(direction, session_id = %session, "Close frame forwarded");
            break;
        }
    }

    done.send_replace(true);

    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(direction, session_id = %session, error = %e, "Close failed"),
        Err(_) => tracing::debug!(direction, session_id = %session, "Close timed out"),
    }
    tracing::debug!(direction, session_id = %session, forwarded, "Direction finished");
}
