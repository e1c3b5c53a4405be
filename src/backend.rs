//! C9 — the backend: owns every active session, the fused transport
//! registry, and the 40 Hz tick loop.
//!
//! Grounded on `EDMOBackend.py`, with task orchestration modeled on the
//! teacher's `lib.rs` ("one tokio task per endpoint, bridged with
//! channels") rather than the Python original's single-coroutine
//! `asyncio.gather`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::codec::Command;
use crate::config::Config;
use crate::error::{BackendError, Result};
use crate::player::channel::PlayerChannel;
use crate::session::{sweep, Session};
use crate::transport::serial;
use crate::transport::udp::UdpTransport;
use crate::transport::{FusedLink, FusedRegistry, TransportKind};

/// Owns the fused transport registry and the `{identity -> Session}` map,
/// and drives the fixed-cadence tick loop.
pub struct Backend {
    config: Config,
    registry: Arc<FusedRegistry>,
    udp: Arc<UdpTransport>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    open_serial_ports: serial::OpenPorts,
}

impl Backend {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let udp = UdpTransport::bind(
            config.udp_bind_port,
            config.udp_broadcast_addr,
            config.udp_stale_after(),
        )
        .await
        .map_err(BackendError::TransportBind)?;

        Ok(Arc::new(Backend {
            config,
            registry: Arc::new(FusedRegistry::new()),
            udp: Arc::new(udp),
            sessions: RwLock::new(HashMap::new()),
            open_serial_ports: Arc::new(SyncMutex::new(HashSet::new())),
        }))
    }

    /// Scans every serial port not already tracked as open and probes it
    /// for an IDENTIFY reply. Called on every tick (spec.md §4.2
    /// "periodically enumerates serial ports") so a port that closed on
    /// error, or a robot plugged in after startup, gets retried on the
    /// next enumeration pass rather than never again.
    async fn scan_serial_ports(self: &Arc<Self>) {
        let backend = self.clone();
        let on_new_link: Arc<
            dyn Fn(Arc<FusedLink>, bool, Option<mpsc::UnboundedReceiver<Command>>) + Send + Sync,
        > = Arc::new(move |link, rising_edge, rx| {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .handle_transport_event(link, rising_edge, rx, TransportKind::Serial)
                    .await
            });
        });

        serial::scan_and_bind(
            self.config.serial_baud,
            self.registry.clone(),
            self.open_serial_ports.clone(),
            on_new_link,
        )
        .await;
    }

    /// Registers a brand-new player on an already-identified robot. The
    /// session itself is created eagerly when the robot's transport is
    /// first adopted (`adopt_new_link`), mirroring `onEDMOConnected`'s
    /// immediate `EDMOSession` construction.
    pub async fn connect_player(
        self: &Arc<Self>,
        identity: &str,
        name: String,
        channel: Box<dyn PlayerChannel>,
    ) -> Result<()> {
        let session = self
            .sessions
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| BackendError::UnknownIdentity(identity.to_string()))?;

        session.register_player(channel, name).await
    }

    async fn get_or_create_session(self: &Arc<Self>, identity: &str, link: Arc<FusedLink>) -> Arc<Session> {
        if let Some(session) = self.sessions.read().await.get(identity) {
            return session.clone();
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(identity.to_string())
            .or_insert_with(|| {
                Session::new(
                    identity.to_string(),
                    link,
                    self.config.default_motor_count,
                    self.config.log_root.clone(),
                )
            })
            .clone()
    }

    /// Identities with an active session, for the HTTP bootstrap's 404
    /// check (spec §4.9: "validates that the identity has an active
    /// session").
    pub async fn is_identity_known(&self, identity: &str) -> bool {
        self.sessions.read().await.contains_key(identity)
    }

    pub async fn session(&self, identity: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(identity).cloned()
    }

    pub async fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn run_program(&self, identity: &str, anomaly: &str, repeats: usize) -> Result<()> {
        let session = self
            .sessions
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| BackendError::UnknownIdentity(identity.to_string()))?;
        sweep::run_program(&session, anomaly, repeats).await
    }

    pub fn tick_hz(&self) -> u32 {
        self.config.tick_hz
    }

    /// Dispatches one `FusedRegistry::connect` outcome. A brand-new link
    /// (`rx` is `Some`) is adopted and pumped for the rest of its life. A
    /// rebind of an already-known identity (`rx` is `None`, since the
    /// receiver was already handed out) only needs the `SESSION_START`
    /// replay on the rising edge to zero-to-one endpoints — spec.md §4.4
    /// "the link emits `onReconnect` on the rising edge of connectedness",
    /// scenario S6 (serial drops, udp re-identifies the same robot: the
    /// next tick must emit `SESSION_START` via udp).
    async fn handle_transport_event(
        self: Arc<Self>,
        link: Arc<FusedLink>,
        rising_edge: bool,
        rx: Option<mpsc::UnboundedReceiver<Command>>,
        kind: TransportKind,
    ) {
        match rx {
            Some(rx) => self.adopt_new_link(link, rx, kind).await,
            None if rising_edge => self.announce_reconnect(link.identity(), kind).await,
            None => {}
        }
    }

    /// Replays `SESSION_START` for an identity whose fused link just rose
    /// from zero to one live endpoint on a transport that was already
    /// pumping inbound commands through an earlier-adopted link.
    async fn announce_reconnect(&self, identity: &str, kind: TransportKind) {
        info!(identity = %identity, transport = ?kind, "edmo reconnected");
        if let Some(session) = self.sessions.read().await.get(identity) {
            session.on_edmo_reconnect().await;
        }
    }

    /// Handles a freshly-identified transport: logs the connection event,
    /// replays `SESSION_START` (`onEDMOReconnect`), and pumps the link's
    /// inbound commands into whichever session owns this identity until
    /// the link's sender side is dropped (port closed / peer evicted).
    async fn adopt_new_link(
        self: Arc<Self>,
        link: Arc<FusedLink>,
        mut rx: mpsc::UnboundedReceiver<Command>,
        kind: TransportKind,
    ) {
        let identity = link.identity().to_string();
        info!(identity = %identity, transport = ?kind, "edmo connected");

        let session = self.get_or_create_session(&identity, link).await;
        session.on_edmo_reconnect().await;

        while let Some(command) = rx.recv().await {
            if let Some(session) = self.sessions.read().await.get(&identity) {
                session.handle_robot_message(command).await;
            }
        }

        warn!(identity = %identity, "edmo link closed");
    }

    /// One full tick: re-scan serial ports, drain/evict UDP, run every
    /// session's write side concurrently. Grounded on `EDMOBackend.update`.
    async fn tick(self: &Arc<Self>) {
        self.scan_serial_ports().await;

        self.udp.broadcast_identify().await;

        let backend = self.clone();
        self.udp.drain_incoming(&self.registry, |link, rising_edge, rx| {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .handle_transport_event(link, rising_edge, rx, TransportKind::Udp)
                    .await
            });
        });

        for identity in self.udp.evict_stale(&self.registry) {
            warn!(identity = %identity, "edmo disconnected (udp stale)");
        }

        let sessions = self.sessions_snapshot().await;
        let updates = sessions.iter().map(|session| session.update());
        futures::future::join_all(updates).await;

        self.remove_empty_sessions().await;
    }

    async fn remove_empty_sessions(&self) {
        let mut empties = Vec::new();
        for (identity, session) in self.sessions.read().await.iter() {
            if !session.has_players().await {
                empties.push(identity.clone());
            }
        }
        if empties.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write().await;
        for identity in empties {
            sessions.remove(&identity);
        }
    }

    /// Runs the tick loop until `shutdown_rx` reports `true` (ctrl-c or the
    /// admin console's `kill`, both in `main`), then closes every session
    /// in turn.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
        let period = self.config.tick_period();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let tick_start = Instant::now();

            tokio::select! {
                _ = self.tick() => {}
                _ = shutdown_rx.changed() => break,
            }

            let elapsed = tick_start.elapsed();
            if let Some(remaining) = period.checked_sub(elapsed) {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }

        self.close_all_sessions().await;
    }

    async fn close_all_sessions(&self) {
        info!("shutting down, closing every session");
        let sessions = self.sessions_snapshot().await;
        for session in sessions {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::channel::MemoryChannel;

    async fn test_backend() -> Arc<Backend> {
        let mut config = Config::default();
        config.udp_bind_port = 0; // ephemeral: avoid colliding across parallel tests
        config.http_bind = "127.0.0.1:0".parse().unwrap();
        Backend::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn unknown_identity_is_refused() {
        let backend = test_backend().await;
        assert!(!backend.is_identity_known("robot-ghost").await);

        let (channel, _handle) = MemoryChannel::pair();
        let err = backend
            .connect_player("robot-ghost", "alice".to_string(), Box::new(channel))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownIdentity(_)));
    }

    #[tokio::test]
    async fn session_created_on_link_and_removed_once_empty() {
        let backend = test_backend().await;
        struct NullEndpoint;
        impl crate::transport::Endpoint for NullEndpoint {
            fn write(&self, _data: &[u8]) {}
        }

        let (link, _rising, rx) =
            backend
                .registry
                .connect("robot-A", TransportKind::Udp, Arc::new(NullEndpoint));
        let rx = rx.unwrap();
        let backend_clone = backend.clone();
        tokio::spawn(async move { backend_clone.adopt_new_link(link, rx, TransportKind::Udp).await });

        // Give the spawned adoption task a moment to create the session.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(backend.is_identity_known("robot-A").await);

        let (channel, handle) = MemoryChannel::pair();
        backend
            .connect_player("robot-A", "alice".to_string(), Box::new(channel))
            .await
            .unwrap();
        handle.connect().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let session = backend.session("robot-A").await.unwrap();
        session.close().await;

        backend.remove_empty_sessions().await;
        assert!(!backend.is_identity_known("robot-A").await);
    }

    /// The reserved `"CLOSE"` message must be handled centrally by the
    /// production dispatcher (`Session::pump_player_events`), not special-
    /// cased by any one `PlayerChannel` implementation. Delivering it
    /// through `MemoryChannel`'s ordinary `ChannelEvent::Message` path
    /// should, on its own, remove the player and close its channel.
    #[tokio::test]
    async fn close_message_removes_player_through_production_pump() {
        let backend = test_backend().await;
        struct NullEndpoint;
        impl crate::transport::Endpoint for NullEndpoint {
            fn write(&self, _data: &[u8]) {}
        }

        let (link, _rising, rx) =
            backend
                .registry
                .connect("robot-B", TransportKind::Udp, Arc::new(NullEndpoint));
        let rx = rx.unwrap();
        let backend_clone = backend.clone();
        tokio::spawn(async move { backend_clone.adopt_new_link(link, rx, TransportKind::Udp).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (channel, handle) = MemoryChannel::pair();
        backend
            .connect_player("robot-B", "carol".to_string(), Box::new(channel))
            .await
            .unwrap();
        handle.connect().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let session = backend.session("robot-B").await.unwrap();
        assert!(session.has_players().await);

        handle.deliver("CLOSE").await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(!session.has_players().await);

        backend.remove_empty_sessions().await;
        assert!(!backend.is_identity_known("robot-B").await);
    }
}
