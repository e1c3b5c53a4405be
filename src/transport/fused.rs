//! C4 — per-identity router binding a serial and/or UDP endpoint.
//!
//! Grounded on `FusedCommunication.py`'s `FusedCommunicationProtocol` /
//! `FusedCommunication`. Writes prefer serial; an identity may have both
//! transports bound concurrently, and inbound is accepted from whichever
//! delivered it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::codec::Command;

/// One concrete channel a fused link can write through.
pub trait Endpoint: Send + Sync {
    fn write(&self, data: &[u8]);
}

/// Router for a single robot identity: holds zero-or-more concrete
/// transports and picks the write destination.
pub struct FusedLink {
    identity: String,
    serial: RwLock<Option<Arc<dyn Endpoint>>>,
    udp: RwLock<Option<Arc<dyn Endpoint>>>,
    inbound_tx: mpsc::UnboundedSender<Command>,
}

impl FusedLink {
    fn new(identity: String, inbound_tx: mpsc::UnboundedSender<Command>) -> Self {
        FusedLink {
            identity,
            serial: RwLock::new(None),
            udp: RwLock::new(None),
            inbound_tx,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn has_connection(&self) -> bool {
        self.serial.read().is_some() || self.udp.read().is_some()
    }

    /// Serial preferred, else UDP, else dropped (spec §4.1/§4.4: writes are
    /// idempotent-by-latest-value, so a write with no endpoint bound is
    /// simply lost rather than queued).
    pub fn write(&self, data: &[u8]) {
        if let Some(endpoint) = self.serial.read().as_ref() {
            endpoint.write(data);
            return;
        }
        if let Some(endpoint) = self.udp.read().as_ref() {
            endpoint.write(data);
        }
    }

    /// Delivers an inbound command decoded from whichever transport it
    /// arrived on.
    pub fn deliver(&self, command: Command) {
        let _ = self.inbound_tx.send(command);
    }

    fn bind_serial(&self, endpoint: Arc<dyn Endpoint>) -> bool {
        let had_connection = self.has_connection();
        *self.serial.write() = Some(endpoint);
        !had_connection && self.has_connection()
    }

    fn bind_udp(&self, endpoint: Arc<dyn Endpoint>) -> bool {
        let had_connection = self.has_connection();
        *self.udp.write() = Some(endpoint);
        !had_connection && self.has_connection()
    }

    fn unbind_serial(&self) -> bool {
        *self.serial.write() = None;
        !self.has_connection()
    }

    fn unbind_udp(&self) -> bool {
        *self.udp.write() = None;
        !self.has_connection()
    }
}

/// Which concrete transport an endpoint event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Serial,
    Udp,
}

/// Central registry of `{identity -> FusedLink}`, plus the edge-triggered
/// EDMO connect/disconnect notifications the backend subscribes to.
pub struct FusedRegistry {
    links: RwLock<HashMap<String, Arc<FusedLink>>>,
}

impl FusedRegistry {
    pub fn new() -> Self {
        FusedRegistry {
            links: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, identity: &str) -> Option<Arc<FusedLink>> {
        self.links.read().get(identity).cloned()
    }

    /// Binds a newly-identified transport endpoint to its fused link,
    /// creating the link (and its inbound command channel) on first sight
    /// of this identity. Returns `(link, is_rising_edge, inbound_rx)` —
    /// `inbound_rx` is `Some` only the first time this identity is seen,
    /// since the receiver can only be taken once.
    pub fn connect(
        &self,
        identity: &str,
        kind: TransportKind,
        endpoint: Arc<dyn Endpoint>,
    ) -> (Arc<FusedLink>, bool, Option<mpsc::UnboundedReceiver<Command>>) {
        let mut inbound_rx_out = None;

        let link = if let Some(existing) = self.links.read().get(identity) {
            existing.clone()
        } else {
            let mut links = self.links.write();
            links
                .entry(identity.to_string())
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    inbound_rx_out = Some(rx);
                    Arc::new(FusedLink::new(identity.to_string(), tx))
                })
                .clone()
        };

        let rising_edge = match kind {
            TransportKind::Serial => link.bind_serial(endpoint),
            TransportKind::Udp => link.bind_udp(endpoint),
        };

        (link, rising_edge, inbound_rx_out)
    }

    /// Unbinds a transport endpoint. Returns `true` on the falling edge to
    /// zero endpoints (the backend should announce EDMO disconnection).
    pub fn disconnect(&self, identity: &str, kind: TransportKind) -> bool {
        let Some(link) = self.get(identity) else {
            return false;
        };
        match kind {
            TransportKind::Serial => link.unbind_serial(),
            TransportKind::Udp => link.unbind_udp(),
        }
    }

    pub fn remove(&self, identity: &str) {
        self.links.write().remove(identity);
    }
}

impl Default for FusedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingEndpoint(StdMutex<Vec<Vec<u8>>>);

    impl Endpoint for RecordingEndpoint {
        fn write(&self, data: &[u8]) {
            self.0.lock().unwrap().push(data.to_vec());
        }
    }

    #[test]
    fn prefers_serial_when_both_bound() {
        let registry = FusedRegistry::new();
        let serial = Arc::new(RecordingEndpoint(StdMutex::new(Vec::new())));
        let udp = Arc::new(RecordingEndpoint(StdMutex::new(Vec::new())));

        let (link, rising1, _rx) = registry.connect("robot-A", TransportKind::Udp, udp.clone());
        assert!(rising1);

        let (link2, rising2, _rx2) = registry.connect("robot-A", TransportKind::Serial, serial.clone());
        assert!(!rising2); // already connected via udp
        assert!(Arc::ptr_eq(&link, &link2));

        link.write(b"hello");
        assert_eq!(serial.0.lock().unwrap().len(), 1);
        assert_eq!(udp.0.lock().unwrap().len(), 0);

        assert!(!registry.disconnect("robot-A", TransportKind::Serial));
        link.write(b"world");
        assert_eq!(udp.0.lock().unwrap().len(), 1);

        assert!(registry.disconnect("robot-A", TransportKind::Udp));
    }
}
