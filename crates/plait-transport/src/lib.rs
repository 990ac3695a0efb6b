//! # PLAIT Transport
//!
//! UDP substrate for the PLAIT tunnel engine.
//!
//! This crate provides:
//! - [`UdpSubstrate`]: a tokio UDP socket implementing
//!   [`plait_core::Substrate`], with optional bouncer relaying
//! - The relay envelope used for bounced links
//! - [`Driver`]: the receive loop and tick loop feeding a
//!   [`plait_core::Registry`]
//!
//! ```text
//!   peer A ──forward(B)──▶ bouncer R ──delivered(A)──▶ peer B
//!                                         reported as (from A, via R)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod driver;
pub mod error;
pub mod relay;
pub mod udp;

pub use driver::{Driver, DriverConfig};
pub use error::{TransportError, TransportResult};
pub use relay::RelayEnvelope;
pub use udp::{Inbound, TransportStats, UdpConfig, UdpSubstrate};

/// Maximum datagram size accepted from the socket
pub const MAX_DATAGRAM: usize = 65_535;
