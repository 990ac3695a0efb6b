//! Tunnel messages carried in the packet data block.
//!
//! Layout: `type u8`, then `tpsn u32` for reliable types, then the fields.
//! One message per packet.

use crate::codec::ByteReader;
use crate::error::CodecError;
use crate::event::FileInterruptReason;
use crate::ids::{FileHash, Route};
use crate::window::AckBatch;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const ACK: u8 = 0x01;
const MESSAGE_SLICE: u8 = 0x02;
const MESSAGE_ACK: u8 = 0x03;
const MESSAGE_CANCEL: u8 = 0x04;
const FILE_REQUEST: u8 = 0x05;
const FILE_SLICE: u8 = 0x06;
const FILE_DONE: u8 = 0x07;
const FILE_CANCEL: u8 = 0x08;
const FILE_REJECT: u8 = 0x09;
const ACCESS_POINT_REQUEST: u8 = 0x0A;
const ACCESS_POINTS: u8 = 0x0B;

/// Payload of a message that consumes a send-window slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reliable {
    /// One slice of a message
    MessageSlice {
        /// Sender's message id
        message: u32,
        /// Total message length
        total_len: u32,
        /// Slice index
        index: u32,
        /// Slice bytes
        data: Vec<u8>,
    },
    /// Receiver assembled the whole message
    MessageAck {
        /// Sender's message id
        message: u32,
    },
    /// Downloader asks for slices of one block
    FileRequest {
        /// Downloader's file id
        file: u32,
        /// Content hash
        hash: FileHash,
        /// File size
        size: u64,
        /// Block index
        block: u32,
        /// Wanted slices of the block
        wanted: u64,
    },
    /// One slice of a file block
    FileSlice {
        /// Downloader's file id
        file: u32,
        /// Block index
        block: u32,
        /// Slice index within the block
        index: u16,
        /// Slice bytes
        data: Vec<u8>,
    },
    /// Downloader finished the file
    FileDone {
        /// Downloader's file id
        file: u32,
    },
}

/// Decoded tunnel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMessage {
    /// Batch acknowledgment
    Ack(AckBatch),
    /// Sequenced message
    Reliable {
        /// Tunnel packet sequence number
        tpsn: u32,
        /// Payload
        payload: Reliable,
    },
    /// Sender gave up on a message
    MessageCancel {
        /// Sender's message id
        message: u32,
    },
    /// Downloader gave up on a file
    FileCancel {
        /// Downloader's file id
        file: u32,
    },
    /// Uploader cannot serve a file
    FileReject {
        /// Downloader's file id
        file: u32,
        /// Reason
        reason: FileInterruptReason,
    },
    /// Ask the peer for more routes
    AccessPointRequest,
    /// Routes the peer can be reached on
    AccessPoints {
        /// Routes
        routes: Vec<Route>,
    },
}

fn put_addr(out: &mut Vec<u8>, addr: SocketAddr) {
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
}

fn get_addr(r: &mut ByteReader<'_>) -> Result<SocketAddr, CodecError> {
    let ip = match r.u8("address")? {
        4 => IpAddr::V4(Ipv4Addr::from(r.array::<4>("address")?)),
        6 => IpAddr::V6(Ipv6Addr::from(r.array::<16>("address")?)),
        _ => return Err(CodecError::Truncated("address family")),
    };
    Ok(SocketAddr::new(ip, r.u16("address")?))
}

impl TunnelMessage {
    /// Whether this message occupies a send-window slot
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::Reliable { .. })
    }

    /// Encode into a data block
    ///
    /// # Errors
    ///
    /// [`CodecError::Oversize`] when a count does not fit its wire field.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(64);
        match self {
            Self::Ack(batch) => {
                out.push(ACK);
                let count =
                    u16::try_from(batch.received.len()).map_err(|_| CodecError::Oversize("ack"))?;
                out.extend_from_slice(&batch.base.to_be_bytes());
                out.extend_from_slice(&count.to_be_bytes());
                let mut mask = vec![0u8; batch.received.len().div_ceil(8)];
                for (i, _) in batch.received.iter().enumerate().filter(|(_, r)| **r) {
                    mask[i / 8] |= 1 << (i % 8);
                }
                out.extend_from_slice(&mask);
                for (tpsn, delay) in [batch.first, batch.last] {
                    out.extend_from_slice(&tpsn.to_be_bytes());
                    out.extend_from_slice(&delay.to_be_bytes());
                }
            }
            Self::Reliable { tpsn, payload } => {
                let ty = match payload {
                    Reliable::MessageSlice { .. } => MESSAGE_SLICE,
                    Reliable::MessageAck { .. } => MESSAGE_ACK,
                    Reliable::FileRequest { .. } => FILE_REQUEST,
                    Reliable::FileSlice { .. } => FILE_SLICE,
                    Reliable::FileDone { .. } => FILE_DONE,
                };
                out.push(ty);
                out.extend_from_slice(&tpsn.to_be_bytes());
                match payload {
                    Reliable::MessageSlice {
                        message,
                        total_len,
                        index,
                        data,
                    } => {
                        out.extend_from_slice(&message.to_be_bytes());
                        out.extend_from_slice(&total_len.to_be_bytes());
                        out.extend_from_slice(&index.to_be_bytes());
                        out.extend_from_slice(data);
                    }
                    Reliable::MessageAck { message } => {
                        out.extend_from_slice(&message.to_be_bytes());
                    }
                    Reliable::FileRequest {
                        file,
                        hash,
                        size,
                        block,
                        wanted,
                    } => {
                        out.extend_from_slice(&file.to_be_bytes());
                        out.extend_from_slice(hash);
                        out.extend_from_slice(&size.to_be_bytes());
                        out.extend_from_slice(&block.to_be_bytes());
                        out.extend_from_slice(&wanted.to_be_bytes());
                    }
                    Reliable::FileSlice {
                        file,
                        block,
                        index,
                        data,
                    } => {
                        out.extend_from_slice(&file.to_be_bytes());
                        out.extend_from_slice(&block.to_be_bytes());
                        out.extend_from_slice(&index.to_be_bytes());
                        out.extend_from_slice(data);
                    }
                    Reliable::FileDone { file } => {
                        out.extend_from_slice(&file.to_be_bytes());
                    }
                }
            }
            Self::MessageCancel { message } => {
                out.push(MESSAGE_CANCEL);
                out.extend_from_slice(&message.to_be_bytes());
            }
            Self::FileCancel { file } => {
                out.push(FILE_CANCEL);
                out.extend_from_slice(&file.to_be_bytes());
            }
            Self::FileReject { file, reason } => {
                out.push(FILE_REJECT);
                out.extend_from_slice(&file.to_be_bytes());
                out.push(reason.code());
            }
            Self::AccessPointRequest => out.push(ACCESS_POINT_REQUEST),
            Self::AccessPoints { routes } => {
                out.push(ACCESS_POINTS);
                let direct: Vec<_> = routes.iter().filter(|r| !r.is_bounced()).collect();
                let bounced: Vec<_> = routes.iter().filter(|r| r.is_bounced()).collect();
                let count = |n: usize| u8::try_from(n).map_err(|_| CodecError::Oversize("routes"));
                out.push(count(direct.len())?);
                for r in direct {
                    put_addr(&mut out, r.destination);
                }
                out.push(count(bounced.len())?);
                for r in bounced {
                    put_addr(&mut out, r.destination);
                    put_addr(&mut out, r.next_hop());
                }
            }
        }
        Ok(out)
    }

    /// Decode a data block
    ///
    /// # Errors
    ///
    /// [`CodecError::UnknownMessage`] or [`CodecError::Truncated`].
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = ByteReader::new(data);
        let ty = r.u8("message type")?;
        let msg = match ty {
            ACK => {
                let base = r.u32("ack")?;
                let count = usize::from(r.u16("ack")?);
                let mask = r.bytes(count.div_ceil(8), "ack mask")?;
                let received = (0..count).map(|i| mask[i / 8] & (1 << (i % 8)) != 0).collect();
                let first = (r.u32("ack")?, r.u32("ack")?);
                let last = (r.u32("ack")?, r.u32("ack")?);
                Self::Ack(AckBatch {
                    base,
                    received,
                    first,
                    last,
                })
            }
            MESSAGE_SLICE | MESSAGE_ACK | FILE_REQUEST | FILE_SLICE | FILE_DONE => {
                let tpsn = r.u32("tpsn")?;
                let payload = match ty {
                    MESSAGE_SLICE => Reliable::MessageSlice {
                        message: r.u32("message slice")?,
                        total_len: r.u32("message slice")?,
                        index: r.u32("message slice")?,
                        data: r.rest().to_vec(),
                    },
                    MESSAGE_ACK => Reliable::MessageAck {
                        message: r.u32("message ack")?,
                    },
                    FILE_REQUEST => Reliable::FileRequest {
                        file: r.u32("file request")?,
                        hash: r.array::<32>("file request")?,
                        size: r.u64("file request")?,
                        block: r.u32("file request")?,
                        wanted: r.u64("file request")?,
                    },
                    FILE_SLICE => Reliable::FileSlice {
                        file: r.u32("file slice")?,
                        block: r.u32("file slice")?,
                        index: r.u16("file slice")?,
                        data: r.rest().to_vec(),
                    },
                    _ => Reliable::FileDone {
                        file: r.u32("file done")?,
                    },
                };
                Self::Reliable { tpsn, payload }
            }
            MESSAGE_CANCEL => Self::MessageCancel {
                message: r.u32("message cancel")?,
            },
            FILE_CANCEL => Self::FileCancel {
                file: r.u32("file cancel")?,
            },
            FILE_REJECT => Self::FileReject {
                file: r.u32("file reject")?,
                reason: FileInterruptReason::from_code(r.u8("file reject")?),
            },
            ACCESS_POINT_REQUEST => Self::AccessPointRequest,
            ACCESS_POINTS => {
                let mut routes = Vec::new();
                for _ in 0..r.u8("access points")? {
                    routes.push(Route::direct(get_addr(&mut r)?));
                }
                for _ in 0..r.u8("access points")? {
                    let destination = get_addr(&mut r)?;
                    let bouncer = get_addr(&mut r)?;
                    routes.push(Route::bounced(destination, bouncer));
                }
                Self::AccessPoints { routes }
            }
            other => return Err(CodecError::UnknownMessage(other)),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: TunnelMessage) {
        let bytes = msg.encode().unwrap();
        assert_eq!(TunnelMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_reliable_messages_roundtrip() {
        roundtrip(TunnelMessage::Reliable {
            tpsn: 7,
            payload: Reliable::MessageSlice {
                message: 1,
                total_len: 5000,
                index: 3,
                data: vec![9; 520],
            },
        });
        roundtrip(TunnelMessage::Reliable {
            tpsn: 8,
            payload: Reliable::FileRequest {
                file: 4,
                hash: [0xAB; 32],
                size: 1 << 40,
                block: 12,
                wanted: 0xF0F0,
            },
        });
        roundtrip(TunnelMessage::Reliable {
            tpsn: 9,
            payload: Reliable::FileSlice {
                file: 4,
                block: 12,
                index: 63,
                data: vec![],
            },
        });
    }

    #[test]
    fn test_ack_mask_bits() {
        let batch = AckBatch {
            base: 100,
            received: vec![true, false, false, true, true, false, true, true, true],
            first: (100, 3),
            last: (108, 0),
        };
        let bytes = TunnelMessage::Ack(batch.clone()).encode().unwrap();
        // type, base, count, two mask bytes, two (tpsn, delay) pairs
        assert_eq!(bytes.len(), 1 + 4 + 2 + 2 + 16);
        assert_eq!(bytes[7], 0b1101_1001);
        assert_eq!(bytes[8], 0b0000_0001);
        assert_eq!(
            TunnelMessage::decode(&bytes).unwrap(),
            TunnelMessage::Ack(batch)
        );
    }

    #[test]
    fn test_access_points_roundtrip() {
        let v4: SocketAddr = "10.1.2.3:4000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:5000".parse().unwrap();
        let relay: SocketAddr = "192.0.2.9:7000".parse().unwrap();
        roundtrip(TunnelMessage::AccessPoints {
            routes: vec![
                Route::direct(v4),
                Route::direct(v6),
                Route::bounced(v4, relay),
            ],
        });
    }

    #[test]
    fn test_unreliable_flag() {
        assert!(!TunnelMessage::AccessPointRequest.is_reliable());
        assert!(
            TunnelMessage::Reliable {
                tpsn: 1,
                payload: Reliable::FileDone { file: 1 }
            }
            .is_reliable()
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(
            TunnelMessage::decode(&[0x7F]),
            Err(CodecError::UnknownMessage(0x7F))
        );
        assert!(matches!(
            TunnelMessage::decode(&[FILE_REQUEST, 0, 0, 0, 1, 0, 0]),
            Err(CodecError::Truncated(_))
        ));
        assert!(TunnelMessage::decode(&[]).is_err());
    }
}
