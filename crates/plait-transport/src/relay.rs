//! Relay envelope for bounced links.
//!
//! ```text
//! ┌──────┬──────┬─────────────────────────┬─────────┐
//! │ 0xBE │ kind │ family, ip, port (BE)   │ payload │
//! └──────┴──────┴─────────────────────────┴─────────┘
//!   kind 1 = forward   (address = final destination)
//!   kind 2 = delivered (address = origin)
//! ```
//!
//! Tunnel packets start with a different magic byte, so a substrate can tell
//! the two apart from the first byte.

use crate::error::{TransportError, TransportResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// First byte of a relay envelope
pub const RELAY_MAGIC: u8 = 0xBE;

const KIND_FORWARD: u8 = 1;
const KIND_DELIVERED: u8 = 2;

/// Decoded relay envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnvelope<'a> {
    /// Ask the bouncer to pass `payload` on to `target`
    Forward {
        /// Final destination
        target: SocketAddr,
        /// Tunnel packet
        payload: &'a [u8],
    },
    /// Payload relayed on behalf of `origin`
    Delivered {
        /// Original sender
        origin: SocketAddr,
        /// Tunnel packet
        payload: &'a [u8],
    },
}

impl<'a> RelayEnvelope<'a> {
    /// Check whether a datagram is a relay envelope
    #[must_use]
    pub fn is_envelope(datagram: &[u8]) -> bool {
        datagram.first() == Some(&RELAY_MAGIC)
    }

    /// Encode the envelope
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (kind, addr, payload) = match self {
            Self::Forward { target, payload } => (KIND_FORWARD, target, payload),
            Self::Delivered { origin, payload } => (KIND_DELIVERED, origin, payload),
        };
        let mut out = Vec::with_capacity(2 + 19 + payload.len());
        out.push(RELAY_MAGIC);
        out.push(kind);
        match addr.ip() {
            IpAddr::V4(ip) => {
                out.push(4);
                out.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.push(6);
                out.extend_from_slice(&ip.octets());
            }
        }
        out.extend_from_slice(&addr.port().to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Decode an envelope
    ///
    /// # Errors
    ///
    /// [`TransportError::Relay`] on a wrong magic, kind or address family, or
    /// a truncated address.
    pub fn decode(datagram: &'a [u8]) -> TransportResult<Self> {
        let [magic, kind, family, rest @ ..] = datagram else {
            return Err(TransportError::Relay("truncated header"));
        };
        if *magic != RELAY_MAGIC {
            return Err(TransportError::Relay("bad magic"));
        }
        let (ip, rest): (IpAddr, &[u8]) = match family {
            4 => {
                let (ip, rest) = split::<4>(rest)?;
                (Ipv4Addr::from(ip).into(), rest)
            }
            6 => {
                let (ip, rest) = split::<16>(rest)?;
                (Ipv6Addr::from(ip).into(), rest)
            }
            _ => return Err(TransportError::Relay("bad address family")),
        };
        let (port, payload) = split::<2>(rest)?;
        let addr = SocketAddr::new(ip, u16::from_be_bytes(port));
        match *kind {
            KIND_FORWARD => Ok(Self::Forward {
                target: addr,
                payload,
            }),
            KIND_DELIVERED => Ok(Self::Delivered {
                origin: addr,
                payload,
            }),
            _ => Err(TransportError::Relay("bad kind")),
        }
    }
}

fn split<const N: usize>(buf: &[u8]) -> TransportResult<([u8; N], &[u8])> {
    let (head, rest) = buf
        .split_first_chunk::<N>()
        .ok_or(TransportError::Relay("truncated address"))?;
    Ok((*head, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_roundtrip_v4() {
        let target: SocketAddr = "192.0.2.7:4000".parse().unwrap();
        let env = RelayEnvelope::Forward {
            target,
            payload: b"packet",
        };
        let bytes = env.encode();
        assert!(RelayEnvelope::is_envelope(&bytes));
        assert_eq!(RelayEnvelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn test_delivered_roundtrip_v6() {
        let origin: SocketAddr = "[2001:db8::1]:9".parse().unwrap();
        let env = RelayEnvelope::Delivered {
            origin,
            payload: &[],
        };
        assert_eq!(RelayEnvelope::decode(&env.encode()).unwrap(), env);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(RelayEnvelope::decode(&[]).is_err());
        assert!(RelayEnvelope::decode(&[RELAY_MAGIC, 1, 4, 1, 2]).is_err());
        assert!(RelayEnvelope::decode(&[RELAY_MAGIC, 9, 4, 1, 2, 3, 4, 0, 1]).is_err());
        assert!(RelayEnvelope::decode(&[RELAY_MAGIC, 1, 5, 1, 2, 3, 4, 0, 1]).is_err());
        assert!(RelayEnvelope::decode(&[0xB7, 1, 4, 1, 2, 3, 4, 0, 1]).is_err());
        assert!(!RelayEnvelope::is_envelope(&[0xB7]));
    }

    proptest::proptest! {
        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(proptest::num::u8::ANY, 0..64)) {
            let _ = RelayEnvelope::decode(&data);
        }

        #[test]
        fn prop_forward_payload_preserved(payload in proptest::collection::vec(proptest::num::u8::ANY, 0..256), port: u16) {
            let target = SocketAddr::from(([10, 1, 2, 3], port));
            let bytes = RelayEnvelope::Forward { target, payload: &payload }.encode();
            let decoded = RelayEnvelope::decode(&bytes).unwrap();
            proptest::prop_assert_eq!(decoded, RelayEnvelope::Forward { target, payload: &payload });
        }
    }
}
