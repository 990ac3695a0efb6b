//! One network path between two tunnel endpoints.
//!
//! A link owns per-path sequencing (LPSN), heartbeat round trips and the
//! latency estimate. Connectivity is derived: a link is connected once it
//! knows the peer's link id, the peer has echoed ours, and one heartbeat
//! round trip produced a latency sample.
//!
//! Heartbeat cadence depends on history:
//!
//! | State                          | Interval        |
//! |--------------------------------|-----------------|
//! | never connected                | 1 s             |
//! | connected                      | 2.5 s keepalive |
//! | connected before, now lost     | 5 s             |

use crate::codec::{PacketBody, PacketCodec, QosBlock};
use crate::config::{TunnelConfig, millis};
use crate::ids::{LinkId, Route, SessionId};
use crate::qos::{Receipt, ReceiveMask};
use crate::substrate::Substrate;
use tracing::{debug, trace, warn};

/// Everything a link needs from its tunnel to put a packet on the wire
pub(crate) struct LinkWire<'a> {
    pub codec: &'a mut PacketCodec,
    pub substrate: &'a dyn Substrate,
    pub local_session: SessionId,
    pub remote_session: SessionId,
    pub local_tunnel: u32,
    pub remote_tunnel: u32,
    pub bootstrap: Option<(u32, &'a [u8])>,
    pub now_ms: u64,
}

/// Connectivity change reported to the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTransition {
    /// Link became connected
    Connected,
    /// Link lost connectivity
    Disconnected,
}

/// Result of feeding an inbound packet to a link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkRecv {
    /// A packet was sent back immediately
    pub replied: bool,
    /// The link sequence number had already been seen
    pub duplicate: bool,
    /// Connectivity change, if any
    pub transition: Option<LinkTransition>,
}

/// Result of a link tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTick {
    /// Link is still usable
    Alive(Option<LinkTransition>),
    /// Link has been silent too long and should be removed
    Expired,
}

#[derive(Debug, Clone, Copy)]
struct LinkTimers {
    heartbeat: u64,
    reconnect: u64,
    keepalive: u64,
    timeout: u64,
    expiry: u64,
}

impl LinkTimers {
    fn from_config(config: &TunnelConfig) -> Self {
        Self {
            heartbeat: millis(config.heartbeat_interval),
            reconnect: millis(config.reconnect_interval),
            keepalive: millis(config.keepalive_interval),
            timeout: millis(config.link_timeout),
            expiry: millis(config.link_expiry),
        }
    }
}

/// One path of a tunnel
#[derive(Debug)]
pub struct Link {
    id: LinkId,
    route: Route,
    timers: LinkTimers,
    created_ms: u64,
    last_recv_ms: Option<u64>,
    last_send_ms: Option<u64>,
    last_heartbeat_ms: Option<u64>,
    next_lpsn: u32,
    received: ReceiveMask,
    heartbeat_pending: Option<(u32, u64)>,
    latency_ms: Option<u32>,
    dest_link: LinkId,
    dest_knows_us: bool,
    connected: bool,
    was_connected: bool,
}

impl Link {
    /// Create a link over `route`
    #[must_use]
    pub fn new(id: LinkId, route: Route, config: &TunnelConfig, now_ms: u64) -> Self {
        Self {
            id,
            route,
            timers: LinkTimers::from_config(config),
            created_ms: now_ms,
            last_recv_ms: None,
            last_send_ms: None,
            last_heartbeat_ms: None,
            next_lpsn: 1,
            received: ReceiveMask::new(),
            heartbeat_pending: None,
            latency_ms: None,
            dest_link: LinkId::UNKNOWN,
            dest_knows_us: false,
            connected: false,
            was_connected: false,
        }
    }

    /// Local link id
    #[must_use]
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Path this link uses
    #[must_use]
    pub fn route(&self) -> Route {
        self.route
    }

    /// Peer's id for this link, once learned
    #[must_use]
    pub fn dest_link(&self) -> LinkId {
        self.dest_link
    }

    /// Smoothed round-trip latency, once measured
    #[must_use]
    pub fn latency_ms(&self) -> Option<u32> {
        self.latency_ms
    }

    /// Whether the link is currently connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether the link has ever been connected
    #[must_use]
    pub fn was_connected(&self) -> bool {
        self.was_connected
    }

    /// Time of the last inbound packet
    #[must_use]
    pub fn last_recv_ms(&self) -> Option<u64> {
        self.last_recv_ms
    }

    /// Time of the last send attempt
    #[must_use]
    pub fn last_send_ms(&self) -> Option<u64> {
        self.last_send_ms
    }

    fn derive_connected(&self) -> bool {
        self.dest_link.is_known() && self.dest_knows_us && self.latency_ms.is_some()
    }

    /// Send tunnel data over this link
    pub(crate) fn send_data(&mut self, wire: &mut LinkWire<'_>, data: Vec<u8>) -> bool {
        self.send(wire, Some(data), false, false)
    }

    /// Send a packet carrying no tunnel data
    pub(crate) fn send_empty(&mut self, wire: &mut LinkWire<'_>) -> bool {
        self.send(wire, None, false, false)
    }

    fn send(
        &mut self,
        wire: &mut LinkWire<'_>,
        data: Option<Vec<u8>>,
        heartbeat_request: bool,
        heartbeat_reply: bool,
    ) -> bool {
        let now = wire.now_ms;
        let sequence = self.next_lpsn;
        self.next_lpsn = self.next_lpsn.wrapping_add(1).max(1);

        let body = PacketBody {
            sender_session: wire.local_session,
            recipient_session: wire.remote_session,
            heartbeat_request,
            heartbeat_reply,
            sender_tunnel: wire.local_tunnel,
            sender_link: self.id,
            recipient_link: self.dest_link,
            qos: Some(QosBlock {
                sequence,
                largest: self.received.largest(),
                mask: self.received.mask(),
            }),
            data,
        };

        let packet = match wire.codec.encode(wire.remote_tunnel, wire.bootstrap, &body) {
            Ok(p) => p,
            Err(e) => {
                warn!(link = self.id.as_u32(), error = %e, "failed to encode packet");
                return false;
            }
        };

        self.last_send_ms = Some(now);
        if heartbeat_request {
            self.heartbeat_pending = Some((sequence, now));
            self.last_heartbeat_ms = Some(now);
        }

        let sent = wire
            .substrate
            .send(&packet, self.route.destination, self.route.bouncer);
        if sent {
            self.received.mark_reported();
        } else {
            trace!(link = self.id.as_u32(), route = %self.route, "substrate refused packet");
        }
        sent
    }

    /// Fold an inbound packet into link state.
    ///
    /// Replies immediately when the peer does not know our link id yet or
    /// asked for a heartbeat.
    pub(crate) fn on_recv(&mut self, wire: &mut LinkWire<'_>, body: &PacketBody) -> LinkRecv {
        let now = wire.now_ms;
        self.last_recv_ms = Some(now);
        let mut result = LinkRecv::default();

        if let Some(qos) = body.qos {
            let owed = body.data.is_some() || body.heartbeat_request;
            if self.received.would_discard_unreported(qos.sequence) {
                trace!(link = self.id.as_u32(), "flushing ack report before shift");
                self.send_empty(wire);
            }
            let newer = self.received.largest() == 0 || qos.sequence > self.received.largest();
            match self.received.record(qos.sequence, owed) {
                Receipt::Fresh => {}
                Receipt::Duplicate | Receipt::TooOld => result.duplicate = true,
            }
            if newer && body.sender_link.is_known() {
                self.dest_link = body.sender_link;
            }
            self.fold_peer_report(qos, body.heartbeat_reply, now);
        }
        if !self.dest_link.is_known() && body.sender_link.is_known() {
            self.dest_link = body.sender_link;
        }
        self.dest_knows_us = body.recipient_link == self.id;

        if !self.dest_knows_us || body.heartbeat_request {
            let request = self.latency_ms.is_none();
            result.replied = self.send(wire, None, request, body.heartbeat_request);
        }

        result.transition = self.update_connected();
        result
    }

    fn fold_peer_report(&mut self, qos: QosBlock, is_reply: bool, now: u64) {
        let Some((lpsn, sent_ms)) = self.heartbeat_pending else {
            return;
        };
        if is_reply && ReceiveMask::report_covers(qos.largest, qos.mask, lpsn) {
            let sample = u32::try_from(now.saturating_sub(sent_ms)).unwrap_or(u32::MAX);
            self.latency_ms = Some(match self.latency_ms {
                None => sample,
                Some(old) => ((u64::from(old) * 7 + u64::from(sample)) / 8) as u32,
            });
            self.heartbeat_pending = None;
            trace!(link = self.id.as_u32(), sample, latency = ?self.latency_ms, "latency sample");
        }
    }

    fn update_connected(&mut self) -> Option<LinkTransition> {
        let now_connected = self.derive_connected();
        if now_connected == self.connected {
            return None;
        }
        self.connected = now_connected;
        if now_connected {
            self.was_connected = true;
            debug!(link = self.id.as_u32(), route = %self.route, latency = ?self.latency_ms, "link connected");
            Some(LinkTransition::Connected)
        } else {
            debug!(link = self.id.as_u32(), route = %self.route, "link disconnected");
            Some(LinkTransition::Disconnected)
        }
    }

    /// Periodic link maintenance: timeouts, heartbeats and ack reports
    pub(crate) fn on_tick(&mut self, wire: &mut LinkWire<'_>) -> LinkTick {
        let now = wire.now_ms;
        let silence = now.saturating_sub(self.last_recv_ms.unwrap_or(self.created_ms));
        if silence >= self.timers.expiry {
            return LinkTick::Expired;
        }

        let mut transition = None;
        if silence >= self.timers.timeout && (self.connected || self.latency_ms.is_some()) {
            self.latency_ms = None;
            self.dest_knows_us = false;
            self.heartbeat_pending = None;
            transition = self.update_connected();
        }

        let interval = if self.connected {
            self.timers.keepalive
        } else if self.was_connected {
            self.timers.reconnect
        } else {
            self.timers.heartbeat
        };
        let due = self
            .last_heartbeat_ms
            .is_none_or(|t| now.saturating_sub(t) >= interval);
        if due {
            self.send(wire, None, true, false);
        } else if self.received.has_unreported() {
            self.send_empty(wire);
        }
        LinkTick::Alive(transition)
    }
}
