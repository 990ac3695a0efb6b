//! # PLAIT Core
//!
//! Tunnel engine of the PLAIT multi-link transport.
//!
//! This crate provides:
//! - Packet encoding and decoding bound to a tunnel identity
//! - Links: one network path each, with heartbeats and latency tracking
//! - Tunnels: session negotiation, reliable delivery and congestion control
//!   over all links of a peer at once
//! - Chunked message and resumable file transfer
//! - The registry routing datagrams to tunnels and driving their timers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Registry                                 │
//! │   (handle arena, inbound routing, tick fan-out, events)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Tunnel                                   │
//! │   (sessions, send/recv windows, congestion, message/file tasks) │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Links                                    │
//! │   (direct or bounced paths, heartbeats, per-link sequencing)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         PacketCodec                              │
//! │   (cleartext header, CRC binding, encrypted body)               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine never touches sockets or files itself. Datagrams leave
//! through a [`Substrate`], file bytes through [`FileWriter`] and
//! [`FileReader`], and everything the application needs to know arrives as
//! [`Event`]s on a channel.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod codec;
pub mod config;
pub mod congestion;
pub mod error;
pub mod event;
pub mod ids;
pub mod link;
pub mod qos;
pub mod registry;
pub mod substrate;
pub mod transfer;
pub mod tunnel;
pub mod window;

pub use codec::{PacketBody, PacketCodec, PacketHeader};
pub use config::{ConfigError, RegistryConfig, TunnelConfig};
pub use congestion::LinkQuality;
pub use error::{CodecError, Error, Result, TransferError};
pub use event::{Event, FileInterruptReason};
pub use ids::{FileHash, LinkId, PeerIdentity, PeerUniqueId, Route, SessionId, TaskId, TunnelHandle};
pub use registry::{Registry, RegistryStats};
pub use substrate::{AcceptedPeer, Acceptor, StaticAcceptor, Substrate, Tick};
pub use transfer::{
    ControlBlock, FileReader, FileWriter, MemoryFile, MemoryReader, MemoryWriter,
};
pub use tunnel::{Tunnel, TunnelStatus};
