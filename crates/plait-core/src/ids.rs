//! Identifiers shared across the tunnel engine.
//!
//! All "unknown" sentinels are zero so that a zeroed wire field reads as
//! "not yet learned".

use std::fmt;
use std::net::SocketAddr;

/// 32-byte tunnel identity shared by both endpoints, stable across reconnects
pub type PeerUniqueId = [u8; 32];

/// Content hash identifying a file (BLAKE3)
pub type FileHash = [u8; 32];

/// Opaque handle exposed to the application.
///
/// Packs an arena slot index (low 16 bits) with the slot generation (high
/// 16 bits), so a handle to a closed tunnel never aliases a newer tunnel that
/// reuses the slot. The same value is used as the tunnel id on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelHandle(u32);

impl TunnelHandle {
    /// Invalid handle, also "unknown tunnel id" on the wire
    pub const INVALID: Self = Self(0);

    /// Pack a slot index and generation
    #[must_use]
    pub fn new(index: u16, generation: u16) -> Self {
        Self((u32::from(generation) << 16) | u32::from(index))
    }

    /// Rebuild a handle from its raw value
    #[must_use]
    pub fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Arena slot index
    #[must_use]
    pub fn index(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Arena slot generation
    #[must_use]
    pub fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Whether this is a usable handle
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.generation() != 0
    }
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{:08x}", self.0)
    }
}

/// 64-bit session identifier.
///
/// Generated from the network timestamp so a restarted endpoint announces a
/// numerically larger ("newer") session than the one its peer remembers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SessionId(u64);

impl SessionId {
    /// Unknown session sentinel
    pub const UNKNOWN: Self = Self(0);

    /// Generate a fresh session id for the given network time
    #[must_use]
    pub fn generate(now_ms: u64) -> Self {
        let salt = plait_crypto::random::random_u32().unwrap_or(0) & 0x000F_FFFF;
        Self(((now_ms.max(1)) << 20) | u64::from(salt))
    }

    /// Rebuild from a raw value
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether the session is known
    #[must_use]
    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Per-tunnel link identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LinkId(u32);

impl LinkId {
    /// Unknown link sentinel
    pub const UNKNOWN: Self = Self(0);

    /// Rebuild from a raw value
    #[must_use]
    pub fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Whether the id is known
    #[must_use]
    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN
    }
}

/// Locally assigned id of a message or file task
pub type TaskId = u32;

/// One network path to a peer: direct, or through a bouncer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    /// Final destination address
    pub destination: SocketAddr,
    /// Relay the packet is handed to, if bounced
    pub bouncer: Option<SocketAddr>,
}

impl Route {
    /// Direct route
    #[must_use]
    pub fn direct(destination: SocketAddr) -> Self {
        Self {
            destination,
            bouncer: None,
        }
    }

    /// Route relayed through `bouncer`
    #[must_use]
    pub fn bounced(destination: SocketAddr, bouncer: SocketAddr) -> Self {
        Self {
            destination,
            bouncer: Some(bouncer),
        }
    }

    /// Address the packet is physically sent to
    #[must_use]
    pub fn next_hop(&self) -> SocketAddr {
        self.bouncer.unwrap_or(self.destination)
    }

    /// Whether the route goes through a bouncer
    #[must_use]
    pub fn is_bounced(&self) -> bool {
        self.bouncer.is_some()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bouncer {
            Some(b) => write!(f, "{} via {}", self.destination, b),
            None => write!(f, "{}", self.destination),
        }
    }
}

/// Key material shared by both ends of a tunnel
#[derive(Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Tunnel unique id, also the CRC binding suffix
    pub unique_id: PeerUniqueId,
    /// Packet cipher secret
    pub secret: [u8; plait_crypto::SECRET_SIZE],
}

impl PeerIdentity {
    /// Build an identity from explicit parts
    #[must_use]
    pub fn new(unique_id: PeerUniqueId, secret: [u8; plait_crypto::SECRET_SIZE]) -> Self {
        Self { unique_id, secret }
    }

    /// Derive the secret from the unique id
    #[must_use]
    pub fn derive(unique_id: PeerUniqueId) -> Self {
        let key = blake3::derive_key("plait 2024-06 tunnel secret", &unique_id);
        let mut secret = [0u8; plait_crypto::SECRET_SIZE];
        secret.copy_from_slice(&key[..plait_crypto::SECRET_SIZE]);
        Self { unique_id, secret }
    }

    /// Derive a full identity from a passphrase
    #[must_use]
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::derive(blake3::derive_key(
            "plait 2024-06 passphrase unique id",
            passphrase.as_bytes(),
        ))
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("unique_id", &hex::encode(&self.unique_id[..8]))
            .finish_non_exhaustive()
    }
}
