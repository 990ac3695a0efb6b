//! UDP substrate.
//!
//! Sends use `try_send_to` so the engine never waits on the socket: a full
//! send buffer reports `false`, which the engine treats as a transient loss.

use crate::MAX_DATAGRAM;
use crate::error::{TransportError, TransportResult};
use crate::relay::RelayEnvelope;
use plait_core::Substrate;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Socket options
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Kernel receive buffer size
    pub recv_buffer_size: usize,
    /// Kernel send buffer size
    pub send_buffer_size: usize,
    /// Forward relay envelopes on behalf of other peers
    pub relay: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 2 * 1024 * 1024,
            send_buffer_size: 2 * 1024 * 1024,
            relay: false,
        }
    }
}

/// Socket counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Datagrams handed to the kernel
    pub packets_sent: u64,
    /// Datagrams read from the socket
    pub packets_received: u64,
    /// Sends the kernel refused
    pub send_errors: u64,
    /// Envelopes forwarded for other peers
    pub relayed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    relayed: AtomicU64,
}

/// Tunnel packet read from the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Packet bytes
    pub data: Vec<u8>,
    /// Original sender
    pub from: SocketAddr,
    /// Bouncer the packet came through
    pub bouncer: Option<SocketAddr>,
}

/// UDP socket implementing [`Substrate`]
#[derive(Debug)]
pub struct UdpSubstrate {
    socket: Arc<UdpSocket>,
    relay: bool,
    closed: AtomicBool,
    counters: Counters,
}

impl UdpSubstrate {
    /// Bind a socket on `addr`
    ///
    /// # Errors
    ///
    /// [`TransportError::BindFailed`] if the socket cannot be created,
    /// configured or bound.
    pub async fn bind(addr: SocketAddr, config: &UdpConfig) -> TransportResult<Self> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let bind_err = |e: std::io::Error| TransportError::BindFailed(e.to_string());

        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
            .map_err(bind_err)?;
        socket
            .set_recv_buffer_size(config.recv_buffer_size)
            .map_err(bind_err)?;
        socket
            .set_send_buffer_size(config.send_buffer_size)
            .map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_err)?;
        debug!(local = ?socket.local_addr().ok(), relay = config.relay, "UDP substrate bound");

        Ok(Self {
            socket: Arc::new(socket),
            relay: config.relay,
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    /// Local socket address
    ///
    /// # Errors
    ///
    /// Socket query failure.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    /// Stop sending and receiving
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Check if the substrate was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            relayed: self.counters.relayed.load(Ordering::Relaxed),
        }
    }

    fn try_send(&self, datagram: &[u8], to: SocketAddr) -> bool {
        match self.socket.try_send_to(datagram, to) {
            Ok(_) => {
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                trace!(%to, error = %e, "send refused");
                false
            }
        }
    }

    /// Wait for the next tunnel packet.
    ///
    /// Relay envelopes are unwrapped or forwarded internally; the call only
    /// returns once a tunnel packet arrives.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] after [`close`](Self::close), or a socket
    /// error.
    pub async fn recv(&self) -> TransportResult<Inbound> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
            if let Some(inbound) = self.unwrap_datagram(&buf[..len], from) {
                return Ok(inbound);
            }
        }
    }

    fn unwrap_datagram(&self, datagram: &[u8], from: SocketAddr) -> Option<Inbound> {
        if !RelayEnvelope::is_envelope(datagram) {
            return Some(Inbound {
                data: datagram.to_vec(),
                from,
                bouncer: None,
            });
        }
        match RelayEnvelope::decode(datagram) {
            Ok(RelayEnvelope::Delivered { origin, payload }) => Some(Inbound {
                data: payload.to_vec(),
                from: origin,
                bouncer: Some(from),
            }),
            Ok(RelayEnvelope::Forward { target, payload }) if self.relay => {
                let delivered = RelayEnvelope::Delivered {
                    origin: from,
                    payload,
                };
                if self.try_send(&delivered.encode(), target) {
                    self.counters.relayed.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
            Ok(RelayEnvelope::Forward { .. }) => {
                trace!(%from, "relaying disabled, dropping envelope");
                None
            }
            Err(e) => {
                trace!(%from, error = %e, "dropping envelope");
                None
            }
        }
    }
}

impl Substrate for UdpSubstrate {
    fn send(&self, packet: &[u8], destination: SocketAddr, bouncer: Option<SocketAddr>) -> bool {
        if self.is_closed() {
            return false;
        }
        match bouncer {
            None => self.try_send(packet, destination),
            Some(bouncer) => {
                let envelope = RelayEnvelope::Forward {
                    target: destination,
                    payload: packet,
                };
                self.try_send(&envelope.encode(), bouncer)
            }
        }
    }
}
