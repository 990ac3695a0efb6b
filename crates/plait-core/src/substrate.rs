//! Boundary with the packet substrate and the application acceptor.

use crate::ids::PeerIdentity;
use std::net::SocketAddr;

/// Periodic scheduling signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tick {
    /// Monotonic tick counter
    pub counter: u64,
    /// Network-synchronized timestamp in milliseconds
    pub now_ms: u64,
}

impl Tick {
    /// Build a tick
    #[must_use]
    pub fn new(counter: u64, now_ms: u64) -> Self {
        Self { counter, now_ms }
    }
}

/// Raw datagram sender.
///
/// Sends are fire-and-forget: `false` means the datagram was not handed to
/// the network and the caller should treat it as a transient failure.
pub trait Substrate: Send + Sync {
    /// Send `packet` to `destination`, through `bouncer` when given
    fn send(&self, packet: &[u8], destination: SocketAddr, bouncer: Option<SocketAddr>) -> bool;
}

impl<S: Substrate + ?Sized> Substrate for std::sync::Arc<S> {
    fn send(&self, packet: &[u8], destination: SocketAddr, bouncer: Option<SocketAddr>) -> bool {
        (**self).send(packet, destination, bouncer)
    }
}

/// Peer resolved from a bootstrap payload
#[derive(Debug, Clone)]
pub struct AcceptedPeer {
    /// Identity of the tunnel to create
    pub identity: PeerIdentity,
    /// Bootstrap bytes this side sends back while the tunnel is unconfirmed
    pub bootstrap: Vec<u8>,
}

/// Decides whether an unidentified inbound packet may create a tunnel
pub trait Acceptor: Send + Sync {
    /// Resolve the peer behind a bootstrap payload, or refuse it
    fn resolve(&self, app_id: u32, bootstrap: &[u8], from: SocketAddr) -> Option<AcceptedPeer>;
}

/// Acceptor that admits a fixed set of identities keyed by bootstrap bytes
#[derive(Debug, Default, Clone)]
pub struct StaticAcceptor {
    app_id: u32,
    peers: Vec<(Vec<u8>, PeerIdentity)>,
}

impl StaticAcceptor {
    /// Acceptor for one application id
    #[must_use]
    pub fn new(app_id: u32) -> Self {
        Self {
            app_id,
            peers: Vec::new(),
        }
    }

    /// Admit `identity` for packets carrying `bootstrap`
    #[must_use]
    pub fn with_peer(mut self, bootstrap: impl Into<Vec<u8>>, identity: PeerIdentity) -> Self {
        self.peers.push((bootstrap.into(), identity));
        self
    }
}

impl Acceptor for StaticAcceptor {
    fn resolve(&self, app_id: u32, bootstrap: &[u8], _from: SocketAddr) -> Option<AcceptedPeer> {
        if app_id != self.app_id {
            return None;
        }
        self.peers
            .iter()
            .find(|(b, _)| b.as_slice() == bootstrap)
            .map(|(b, identity)| AcceptedPeer {
                identity: identity.clone(),
                bootstrap: b.clone(),
            })
    }
}
