use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use negotiation_webrtc::Negotiator;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge;
use crate::config::Config;
use crate::monitor;
use crate::protocol::{self, DecodeError, Inbound};
use crate::session::{teardown, CloseReason, Outbound, Session, SessionRegistry};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub negotiator: Arc<dyn Negotiator>,
}

/// WebSocket upgrade handler. Every accepted socket becomes one session.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Arc::new(Session::new(tx));

    state.registry.register(session.clone());
    info!(
        session_id = %session.id,
        active = state.registry.len(),
        "session opened"
    );

    spawn_writer(sink, rx, state.registry.clone(), session.clone());
    monitor::spawn_monitor(state.registry.clone(), session.clone(), state.config.liveness);

    if let Some(reason) = receive_loop(stream, &state, &session).await {
        teardown(&state.registry, &session, reason).await;
    }
}

/// Read frames until the client goes away or the session is shut down from
/// elsewhere. Returns the close reason when this loop is the one that
/// noticed, None when teardown already ran.
async fn receive_loop(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    session: &Arc<Session>,
) -> Option<CloseReason> {
    let shutdown = session.shutdown.notified();
    tokio::pin!(shutdown);

    loop {
        let frame = tokio::select! {
            _ = &mut shutdown => return None,
            frame = stream.next() => frame,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(session_id = %session.id, error = %err, "transport receive failed");
                return Some(CloseReason::TransportError);
            }
            None => return Some(CloseReason::ClientDisconnect),
        };

        // Any traffic at all proves the client is alive.
        session.touch().await;

        match message {
            Message::Text(text) => dispatch(state, session, &text),
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => dispatch(state, session, &text),
                Err(_) => {
                    warn!(session_id = %session.id, "discarding non-utf8 binary frame");
                }
            },
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                debug!(session_id = %session.id, "close frame received");
                return Some(CloseReason::ClientDisconnect);
            }
        }
    }
}

/// Classify a decoded frame and hand it off. Offer and candidate work runs
/// on its own task so a slow negotiation never blocks the read side.
fn dispatch(state: &AppState, session: &Arc<Session>, raw: &str) {
    match protocol::decode(raw) {
        Ok(Inbound::Offer { sdp }) => {
            let state = state.clone();
            let session = session.clone();
            tokio::spawn(async move {
                bridge::handle_offer(&state, &session, sdp).await;
            });
        }
        Ok(Inbound::Ice { candidate }) => {
            let session = session.clone();
            tokio::spawn(async move {
                bridge::handle_candidate(&session, candidate).await;
            });
        }
        Ok(Inbound::Pong) => {}
        Ok(Inbound::Unknown(kind)) => {
            debug!(session_id = %session.id, kind = %kind, "ignoring unknown frame type");
        }
        Err(err @ DecodeError::Malformed(_)) => {
            warn!(session_id = %session.id, error = %err, "discarding malformed frame");
        }
        Err(err) => {
            warn!(session_id = %session.id, error = %err, "discarding invalid frame");
        }
    }
}

/// The writer task is the only owner of the socket sink, so every outbound
/// frame is serialized through one queue.
fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    registry: SessionRegistry,
    session: Arc<Session>,
) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let frame = match message {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(json) => Message::Text(json),
                    Err(err) => {
                        warn!(session_id = %session.id, error = %err, "dropping unserializable frame");
                        continue;
                    }
                },
                Outbound::Ping => Message::Ping(Vec::new()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(err) = sink.send(frame).await {
                warn!(session_id = %session.id, error = %err, "transport send failed");
                teardown(&registry, &session, CloseReason::TransportError).await;
                break;
            }
        }
        debug!(session_id = %session.id, "writer task stopped");
    });
}
