//! In-process network for deterministic multi-node tests
//!
//! Every node is a [`Registry`] attached to a shared wire. Datagrams queue on
//! the wire until the test moves them, time only advances when the test
//! ticks, and a drop rule can discard or observe any datagram in flight.
//!
//! # Example
//!
//! ```no_run
//! use plait_integration_tests::fixtures::LoopbackNetwork;
//!
//! let mut net = LoopbackNetwork::new();
//! let client = net.add_node("10.0.0.1:1000");
//! let server = net.add_listener("10.0.0.2:2000", "secret", b"hello");
//! // open tunnels on `net.node(client).registry`, then:
//! net.run(20, 10);
//! ```

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use plait_core::tunnel::TunnelMessage;
use plait_core::{
    Event, PacketCodec, PeerIdentity, Registry, RegistryConfig, StaticAcceptor, Substrate, Tick,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Application id every loopback node uses
pub const APP_ID: u32 = 7;

/// Upper bound on hops [`LoopbackNetwork::settle`] performs
const MAX_SETTLE_HOPS: usize = 500;

/// One datagram in flight
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Packet bytes
    pub data: Vec<u8>,
    /// Sending node
    pub from: SocketAddr,
    /// Destination node
    pub to: SocketAddr,
    /// Relay the sender asked for
    pub bouncer: Option<SocketAddr>,
}

type DropRule = Box<dyn FnMut(&Datagram) -> bool + Send>;

#[derive(Default)]
struct Wire {
    queue: Mutex<VecDeque<Datagram>>,
    drop_rule: Mutex<Option<DropRule>>,
    dropped: AtomicUsize,
}

/// Substrate of one node: stamps the node's address and queues on the wire
struct Port {
    addr: SocketAddr,
    wire: Arc<Wire>,
}

impl Substrate for Port {
    fn send(&self, packet: &[u8], destination: SocketAddr, bouncer: Option<SocketAddr>) -> bool {
        self.wire.queue.lock().push_back(Datagram {
            data: packet.to_vec(),
            from: self.addr,
            to: destination,
            bouncer,
        });
        true
    }
}

/// A registry attached to the loopback wire
pub struct LoopbackNode {
    /// Address other nodes reach this one on
    pub addr: SocketAddr,
    /// Engine under test
    pub registry: Arc<Registry>,
    /// Event stream of the registry
    pub events: Receiver<Event>,
}

impl LoopbackNode {
    /// Everything emitted since the last call
    pub fn drain_events(&self) -> Vec<Event> {
        self.events.try_iter().collect()
    }
}

/// Deterministic network of loopback nodes
pub struct LoopbackNetwork {
    wire: Arc<Wire>,
    nodes: Vec<LoopbackNode>,
    now_ms: u64,
    ticks: u64,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    /// Empty network; the clock starts at one second
    pub fn new() -> Self {
        Self {
            wire: Arc::new(Wire::default()),
            nodes: Vec::new(),
            now_ms: 1_000,
            ticks: 0,
        }
    }

    /// Add a node with the default registry configuration
    pub fn add_node(&mut self, addr: &str) -> usize {
        self.add_node_with(
            addr,
            RegistryConfig {
                app_id: APP_ID,
                ..RegistryConfig::default()
            },
        )
    }

    /// Add a node with a custom registry configuration
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a socket address.
    pub fn add_node_with(&mut self, addr: &str, config: RegistryConfig) -> usize {
        let addr: SocketAddr = addr.parse().expect("node address");
        let port = Arc::new(Port {
            addr,
            wire: self.wire.clone(),
        });
        let (registry, events) = Registry::new(config, port);
        let registry = Arc::new(registry);
        registry.on_tick(Tick::new(self.ticks, self.now_ms));
        self.nodes.push(LoopbackNode {
            addr,
            registry,
            events,
        });
        self.nodes.len() - 1
    }

    /// Add a node that accepts tunnels for `passphrase` announced with
    /// `bootstrap`
    pub fn add_listener(&mut self, addr: &str, passphrase: &str, bootstrap: &[u8]) -> usize {
        let index = self.add_node(addr);
        self.nodes[index].registry.set_acceptor(Arc::new(
            StaticAcceptor::new(APP_ID)
                .with_peer(bootstrap.to_vec(), PeerIdentity::from_passphrase(passphrase)),
        ));
        index
    }

    /// Node by index
    pub fn node(&self, index: usize) -> &LoopbackNode {
        &self.nodes[index]
    }

    /// Current network time
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Datagrams discarded by the drop rule so far
    pub fn dropped(&self) -> usize {
        self.wire.dropped.load(Ordering::Relaxed)
    }

    /// Datagrams waiting on the wire
    pub fn in_flight(&self) -> usize {
        self.wire.queue.lock().len()
    }

    /// Install a rule deciding which datagrams to discard (`true` drops)
    pub fn set_drop_rule(&self, rule: impl FnMut(&Datagram) -> bool + Send + 'static) {
        *self.wire.drop_rule.lock() = Some(Box::new(rule));
    }

    /// Remove the drop rule
    pub fn clear_drop_rule(&self) {
        *self.wire.drop_rule.lock() = None;
    }

    /// Advance the clock and tick every node
    pub fn tick(&mut self, advance_ms: u64) {
        self.now_ms += advance_ms;
        self.ticks += 1;
        for node in &self.nodes {
            node.registry.on_tick(Tick::new(self.ticks, self.now_ms));
        }
    }

    /// Deliver everything currently on the wire; replies wait for the next
    /// hop. Returns the number of datagrams moved.
    pub fn hop(&self) -> usize {
        let batch: Vec<Datagram> = self.wire.queue.lock().drain(..).collect();
        let mut moved = 0;
        for datagram in batch {
            let drop = self
                .wire
                .drop_rule
                .lock()
                .as_mut()
                .is_some_and(|rule| rule(&datagram));
            if drop {
                self.wire.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if let Some(node) = self.nodes.iter().find(|n| n.addr == datagram.to) {
                node.registry
                    .on_packet(&datagram.data, datagram.from, datagram.bouncer);
                moved += 1;
            }
        }
        moved
    }

    /// Hop until the wire is quiet
    pub fn settle(&self) {
        for _ in 0..MAX_SETTLE_HOPS {
            if self.hop() == 0 && self.in_flight() == 0 {
                return;
            }
        }
    }

    /// Tick by `step_ms` and move one hop, `rounds` times
    pub fn step(&mut self, rounds: usize, step_ms: u64) {
        for _ in 0..rounds {
            self.tick(step_ms);
            self.hop();
        }
    }

    /// Tick by `step_ms` and settle, `rounds` times
    pub fn run(&mut self, rounds: usize, step_ms: u64) {
        for _ in 0..rounds {
            self.tick(step_ms);
            self.settle();
        }
    }

    /// Run rounds until `done` holds; returns whether it did within
    /// `max_rounds`
    pub fn run_until(
        &mut self,
        max_rounds: usize,
        step_ms: u64,
        mut done: impl FnMut(&Self) -> bool,
    ) -> bool {
        for _ in 0..max_rounds {
            if done(self) {
                return true;
            }
            self.tick(step_ms);
            self.hop();
        }
        done(self)
    }
}

/// Decrypt a datagram of the tunnel keyed by `identity` and decode the
/// tunnel message it carries
pub fn decode_message(identity: &PeerIdentity, data: &[u8]) -> Option<TunnelMessage> {
    let codec = PacketCodec::new(identity.unique_id, &identity.secret);
    let body = codec.decode(data).ok()?;
    TunnelMessage::decode(body.data.as_deref()?).ok()
}
