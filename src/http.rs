//! HTTP/WebSocket bootstrap endpoint (spec §1 / SPEC_FULL §4.9).
//!
//! WebRTC signalling itself — SDP offer/answer, ICE — is an explicit
//! external collaborator the spec treats as opaque; this module only reads
//! one JSON handshake message off the freshly-upgraded socket and yields a
//! `PlayerChannel` to the backend. The raw `axum` websocket doubles as the
//! duplex text channel: real SDP negotiation would ride over this same
//! socket in a full deployment, but performing it is out of scope here
//! (`WebRtcDataChannel` in `player::channel` is the production adapter for
//! once that negotiation exists elsewhere).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::error::BackendError;
use crate::player::channel::{ChannelEvent, PlayerChannel};

#[derive(Debug, Deserialize)]
struct Handshake {
    #[serde(rename = "playerName")]
    player_name: String,
    /// Opaque per spec §1 — never parsed or acted on by this crate.
    #[allow(dead_code)]
    #[serde(default)]
    handshake: serde_json::Value,
}

pub fn router(backend: Arc<Backend>) -> Router {
    Router::new()
        .route("/session/:identity/connect", get(connect))
        .with_state(backend)
}

async fn connect(
    State(backend): State<Arc<Backend>>,
    Path(identity): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if !backend.is_identity_known(&identity).await {
        return (StatusCode::NOT_FOUND, "unknown identity").into_response();
    }

    ws.on_upgrade(move |socket| async move {
        if let Err(err) = handle_socket(backend, identity.clone(), socket).await {
            warn!(identity = %identity, error = %err, "player onboarding failed");
        }
    })
}

async fn handle_socket(
    backend: Arc<Backend>,
    identity: String,
    mut socket: WebSocket,
) -> anyhow::Result<()> {
    let handshake_text = match socket.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            let _ = socket.close().await;
            return Ok(());
        }
    };
    let handshake: Handshake = serde_json::from_str(&handshake_text)?;

    let (channel, outbound_rx, events_tx) = AxumWsChannel::new();
    let result = backend
        .connect_player(&identity, handshake.player_name.clone(), Box::new(channel))
        .await;

    if let Err(err) = result {
        let code = match err {
            BackendError::UnknownIdentity(_) => 4004,
            BackendError::SessionFull { .. } => 4001,
            _ => 4000,
        };
        let _ = socket
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code,
                reason: err.to_string().into(),
            })))
            .await;
        return Ok(());
    }

    info!(identity = %identity, player = %handshake.player_name, "player onboarded");
    pump_socket(socket, outbound_rx, events_tx).await;
    Ok(())
}

/// Bridges a split `axum` websocket into the `PlayerChannel` event stream:
/// every inbound text frame becomes a `ChannelEvent::Message` unconditionally
/// — the reserved `"CLOSE"` text is not special-cased here. It's handled
/// once, centrally, by `Session::pump_player_events`, which calls
/// `AxumWsChannel::close()` when it sees it; that's what actually closes
/// the socket, via `Outbound::Close` on this same `outbound_rx`.
async fn pump_socket(
    mut socket: WebSocket,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events_tx: mpsc::Sender<ChannelEvent>,
) {
    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(Outbound::Text(text)) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Outbound::Close) => {
                        let _ = socket.close().await;
                        return;
                    }
                    None => return,
                }
            }
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if events_tx.send(ChannelEvent::Message(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events_tx.send(ChannelEvent::Closed).await;
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => {
                        let _ = events_tx.send(ChannelEvent::Closed).await;
                        return;
                    }
                }
            }
        }
    }
}

/// An outbound instruction to `pump_socket`: either send text, or close the
/// real socket out from under it. Needed because `close()` takes `&self`
/// and the `WebSocket` itself lives only inside the split-off pump task.
enum Outbound {
    Text(String),
    Close,
}

/// `PlayerChannel` implementor backed by a split `axum` websocket. The
/// connect/disconnect/message events it reports come from the reader half
/// driven by `pump_socket`; sends (and the close instruction) are buffered
/// onto `outbound` until `pump_socket` picks them up.
struct AxumWsChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    events_rx: Option<mpsc::Receiver<ChannelEvent>>,
}

impl AxumWsChannel {
    fn new() -> (
        Self,
        mpsc::UnboundedReceiver<Outbound>,
        mpsc::Sender<ChannelEvent>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(64);
        let _ = events_tx.try_send(ChannelEvent::Connected);
        (
            AxumWsChannel {
                outbound: outbound_tx,
                events_rx: Some(events_rx),
            },
            outbound_rx,
            events_tx,
        )
    }
}

#[async_trait::async_trait]
impl PlayerChannel for AxumWsChannel {
    fn send(&self, text: &str) {
        let _ = self.outbound.send(Outbound::Text(text.to_string()));
    }

    async fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    fn take_events(&mut self) -> mpsc::Receiver<ChannelEvent> {
        self.events_rx.take().expect("AxumWsChannel events taken twice")
    }
}
