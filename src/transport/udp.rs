//! C3 — UDP discovery and telemetry transport.
//!
//! Grounded on `EDMOUdp.py` and, for the tokio socket send/recv shape, on
//! the teacher's own UDP send/recv handling
//! (bind, periodic broadcast tick, staleness-timeout disconnect).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::codec::{self, Instruction};
use crate::transport::fused::{Endpoint, FusedLink, FusedRegistry, TransportKind};

/// A single UDP peer: the remote address an identified robot answers from.
struct UdpPeer {
    addr: SocketAddr,
    identity: String,
    last_response: Mutex<Instant>,
    socket: Arc<UdpSocket>,
}

impl Endpoint for UdpPeer {
    fn write(&self, data: &[u8]) {
        let socket = self.socket.clone();
        let addr = self.addr;
        let data = data.to_vec();
        tokio::spawn(async move {
            let _ = socket.send_to(&data, addr).await;
        });
    }
}

impl UdpPeer {
    fn touch(&self) {
        *self.last_response.lock() = Instant::now();
    }

    fn is_stale(&self, after: Duration) -> bool {
        self.last_response.lock().elapsed() > after
    }
}

/// Owns the discovery/telemetry UDP socket and the table of identified
/// peers keyed by remote address.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
    stale_after: Duration,
    peers: Mutex<HashMap<SocketAddr, Arc<UdpPeer>>>,
}

impl UdpTransport {
    pub async fn bind(
        bind_port: u16,
        broadcast_addr: SocketAddr,
        stale_after: Duration,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", bind_port)).await?;
        socket.set_broadcast(true)?;

        Ok(UdpTransport {
            socket: Arc::new(socket),
            broadcast_addr,
            stale_after,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Sends the IDENTIFY discovery broadcast. Called once per tick.
    pub async fn broadcast_identify(&self) {
        let packet = codec::create(Instruction::Identify, &[]);
        let _ = self.socket.send_to(&packet, self.broadcast_addr).await;
    }

    /// Reads every datagram currently available without blocking, routing
    /// each to its fused link (creating a peer on a fresh IDENTIFY reply).
    /// `on_new_link` fires for every `FusedRegistry::connect` outcome for a
    /// newly-identified peer, carrying the rising-edge flag as well as the
    /// inbound receiver (only `Some` the first time this identity is ever
    /// seen) — the caller needs the edge even when it already owns the
    /// link's receiver, to replay `SESSION_START` on reconnect (spec §4.4,
    /// scenario S6).
    pub fn drain_incoming(
        &self,
        registry: &FusedRegistry,
        mut on_new_link: impl FnMut(
            Arc<FusedLink>,
            bool,
            Option<tokio::sync::mpsc::UnboundedReceiver<codec::Command>>,
        ),
    ) {
        let mut buf = [0u8; 2048];
        loop {
            let (len, addr) = match self.socket.try_recv_from(&mut buf) {
                Ok(result) => result,
                Err(_) => return,
            };

            let command = codec::try_parse(&buf[..len]);

            let existing = self.peers.lock().get(&addr).cloned();
            match existing {
                Some(peer) => {
                    peer.touch();
                    if let Some(link) = registry.get(&peer.identity) {
                        link.deliver(command);
                    }
                }
                None => {
                    if command.instruction == Instruction::Identify {
                        if let Ok(identity) = String::from_utf8(command.data.clone()) {
                            let peer = Arc::new(UdpPeer {
                                addr,
                                identity: identity.clone(),
                                last_response: Mutex::new(Instant::now()),
                                socket: self.socket.clone(),
                            });
                            self.peers.lock().insert(addr, peer.clone());

                            let (link, rising_edge, rx) =
                                registry.connect(&identity, TransportKind::Udp, peer);
                            on_new_link(link, rising_edge, rx);
                        }
                    }
                    // Any other unsolicited datagram from an unknown peer is dropped.
                }
            }
        }
    }

    /// Evicts peers that haven't replied within the staleness window,
    /// unbinding each from its fused link. Returns the identities that
    /// transitioned to fully disconnected.
    pub fn evict_stale(&self, registry: &FusedRegistry) -> Vec<String> {
        let stale: Vec<Arc<UdpPeer>> = self
            .peers
            .lock()
            .values()
            .filter(|peer| peer.is_stale(self.stale_after))
            .cloned()
            .collect();

        let mut disconnected = Vec::new();
        for peer in stale {
            self.peers.lock().remove(&peer.addr);
            if registry.disconnect(&peer.identity, TransportKind::Udp) {
                disconnected.push(peer.identity.clone());
            }
        }
        disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_and_enables_broadcast() {
        let transport =
            UdpTransport::bind(0, "127.0.0.1:2121".parse().unwrap(), Duration::from_secs(5))
                .await
                .unwrap();
        transport.broadcast_identify().await;
    }

    #[tokio::test]
    async fn identify_datagram_creates_peer_and_routes_follow_up() {
        let server =
            UdpTransport::bind(0, "127.0.0.1:2121".parse().unwrap(), Duration::from_secs(5))
                .await
                .unwrap();
        let server_addr = server.socket.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let identify = codec::create(Instruction::Identify, b"robot-A");
        client.send_to(&identify, server_addr).await.unwrap();

        // Give the datagram a moment to land in the kernel buffer.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let registry = FusedRegistry::new();
        let mut new_links = Vec::new();
        server.drain_incoming(&registry, |link, rising_edge, _rx| {
            new_links.push((link, rising_edge))
        });

        assert_eq!(new_links.len(), 1);
        assert_eq!(new_links[0].0.identity(), "robot-A");
        assert!(new_links[0].1);
    }
}
