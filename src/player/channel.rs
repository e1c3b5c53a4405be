//! C7 — the player-facing duplex text channel.
//!
//! WebRTC signalling (SDP offer/answer, ICE) is an explicit external
//! collaborator (spec §1): this crate treats the channel as opaque,
//! exposing it as a trait so the session logic never depends on how the
//! bytes actually move. `MemoryChannel` is the in-memory test double spec
//! §4.7 describes; `WebRtcDataChannel` is the thin production adapter over
//! an already-negotiated `webrtc` data channel.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One lifecycle or inbound-text event from a player channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Closed,
    Message(String),
}

/// A duplex text channel bound to one player.
///
/// Implementors only need to get bytes in and out and report lifecycle
/// transitions through the event stream `take_events()` hands back; the
/// reserved `CLOSE` inbound message is handled once, centrally, by
/// `Session::pump_player_events` rather than by each impl.
#[async_trait]
pub trait PlayerChannel: Send + Sync {
    /// Sends text to the player. Implementations buffer until the
    /// underlying transport is open (spec §4.7).
    fn send(&self, text: &str);

    /// Closes the channel. Idempotent.
    async fn close(&self);

    /// Takes the event receiver. Panics if called more than once — a
    /// channel has exactly one consumer (its `Player`).
    fn take_events(&mut self) -> mpsc::Receiver<ChannelEvent>;
}

/// In-memory duplex channel used by every test in this crate (spec §4.7:
/// "for testing it is a pair of in-memory queues").
pub struct MemoryChannel {
    outbound: mpsc::UnboundedSender<String>,
    events_tx: mpsc::Sender<ChannelEvent>,
    events_rx: Option<mpsc::Receiver<ChannelEvent>>,
}

/// The test-side handle: drives inbound events and observes outbound sends.
pub struct MemoryChannelHandle {
    pub outbound: mpsc::UnboundedReceiver<String>,
    events_tx: mpsc::Sender<ChannelEvent>,
}

impl MemoryChannel {
    pub fn pair() -> (Self, MemoryChannelHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(64);

        let channel = MemoryChannel {
            outbound: outbound_tx,
            events_tx: events_tx.clone(),
            events_rx: Some(events_rx),
        };
        let handle = MemoryChannelHandle {
            outbound: outbound_rx,
            events_tx,
        };

        (channel, handle)
    }
}

impl MemoryChannelHandle {
    pub async fn connect(&self) {
        let _ = self.events_tx.send(ChannelEvent::Connected).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.events_tx.send(ChannelEvent::Disconnected).await;
    }

    pub async fn deliver(&self, text: impl Into<String>) {
        let _ = self.events_tx.send(ChannelEvent::Message(text.into())).await;
    }
}

#[async_trait]
impl PlayerChannel for MemoryChannel {
    fn send(&self, text: &str) {
        let _ = self.outbound.send(text.to_string());
    }

    async fn close(&self) {
        let _ = self.events_tx.send(ChannelEvent::Closed).await;
    }

    fn take_events(&mut self) -> mpsc::Receiver<ChannelEvent> {
        self.events_rx
            .take()
            .expect("MemoryChannel events taken twice")
    }
}

/// Thin adapter over an already-negotiated `webrtc` crate data channel.
///
/// The peer-connection handshake itself lives in the HTTP bootstrap
/// endpoint (out of scope per spec §1); this type only forwards
/// `on_message`/`on_close` into the `PlayerChannel` event stream and
/// buffers sends until the channel reports `Open`, mirroring
/// `WebRTCPeer.send`'s `sendBuffer` in the original source.
pub struct WebRtcDataChannel {
    channel: std::sync::Arc<webrtc::data_channel::RTCDataChannel>,
    events_rx: Option<mpsc::Receiver<ChannelEvent>>,
}

impl WebRtcDataChannel {
    /// Wraps a data channel that has already completed negotiation,
    /// wiring its callbacks into a fresh event stream.
    pub fn new(channel: std::sync::Arc<webrtc::data_channel::RTCDataChannel>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);

        let opened_tx = events_tx.clone();
        channel.on_open(Box::new(move || {
            let opened_tx = opened_tx.clone();
            Box::pin(async move {
                let _ = opened_tx.send(ChannelEvent::Connected).await;
            })
        }));

        let closed_tx = events_tx.clone();
        channel.on_close(Box::new(move || {
            let closed_tx = closed_tx.clone();
            Box::pin(async move {
                let _ = closed_tx.send(ChannelEvent::Closed).await;
            })
        }));

        let message_tx = events_tx;
        channel.on_message(Box::new(move |msg| {
            let message_tx = message_tx.clone();
            Box::pin(async move {
                if let Ok(text) = String::from_utf8(msg.data.to_vec()) {
                    let _ = message_tx.send(ChannelEvent::Message(text)).await;
                }
            })
        }));

        WebRtcDataChannel {
            channel,
            events_rx: Some(events_rx),
        }
    }
}

#[async_trait]
impl PlayerChannel for WebRtcDataChannel {
    fn send(&self, text: &str) {
        let channel = self.channel.clone();
        let text = text.to_string();
        tokio::spawn(async move {
            let _ = channel.send_text(text).await;
        });
    }

    async fn close(&self) {
        let _ = self.channel.close().await;
    }

    fn take_events(&mut self) -> mpsc::Receiver<ChannelEvent> {
        self.events_rx
            .take()
            .expect("WebRtcDataChannel events taken twice")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_channel_round_trips_messages() {
        let (mut channel, handle) = MemoryChannel::pair();
        let mut events = channel.take_events();

        channel.send("hello");
        assert_eq!(handle.outbound.recv().await, Some("hello".to_string()));

        handle.deliver("world").await;
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Message("world".to_string()))
        );
    }
}
