//! Wire packet codec.
//!
//! ```text
//! ┌───────┬───────┬─────────┬───────┬─────────────┐
//! │ magic │ flags │ version │ crc32 │ dest tunnel │   11 bytes, cleartext
//! ├───────┴───────┴─────────┴───────┴─────────────┤
//! │ [bootstrap: app id u32, len u16, bytes]        │   optional, cleartext
//! ├───────────────────────────────────────────────┤
//! │ nonce u32                                      │   cleartext
//! ├───────────────────────────────────────────────┤
//! │ sessions, flags, tunnel/link ids               │
//! │ [qos: seq u32, largest u32, mask u64]          │   encrypted
//! │ [data: len u16, bytes]                         │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Decoding is split so the cheapest checks run first: [`PacketHeader::parse`]
//! validates magic, version and declared lengths without any key material,
//! [`PacketHeader::verify_crc`] binds the packet to a tunnel unique id, and
//! only then does [`PacketCodec::open`] decrypt and parse the body.

use crate::error::CodecError;
use crate::ids::{LinkId, PeerUniqueId, SessionId};
use plait_crypto::{BLOCK_SIZE, Crc32, PacketCipher, SECRET_SIZE};

/// First byte of every packet
pub const MAGIC: u8 = 0xB7;

/// Wire format version
pub const VERSION: u8 = 1;

/// Cleartext header size
pub const HEADER_SIZE: usize = 11;

/// Fixed part of the decrypted body
pub const BODY_HEADER_SIZE: usize = 29;

/// QoS block size
pub const QOS_SIZE: usize = 16;

const CRC_OFFSET: usize = 3;
const NONCE_SIZE: usize = 4;

/// Header flag: bootstrap payload present
pub const FLAG_BOOTSTRAP: u8 = 0x01;

const BODY_QOS: u8 = 0x01;
const BODY_DATA: u8 = 0x02;
const BODY_HB_REQUEST: u8 = 0x04;
const BODY_HB_REPLY: u8 = 0x08;

/// Per-link sequencing block carried in every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QosBlock {
    /// Sender's link sequence number for this packet
    pub sequence: u32,
    /// Largest link sequence number the sender has received
    pub largest: u32,
    /// Receipt bitmask: bit `i` set means `largest - i` was received
    pub mask: u64,
}

/// Decrypted packet body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketBody {
    /// Session of the sender
    pub sender_session: SessionId,
    /// Session the sender believes we are in
    pub recipient_session: SessionId,
    /// Sender asks for an immediate reply
    pub heartbeat_request: bool,
    /// Packet answers a heartbeat request
    pub heartbeat_reply: bool,
    /// Sender's local tunnel id
    pub sender_tunnel: u32,
    /// Sender's local link id
    pub sender_link: LinkId,
    /// Our link id as known by the sender
    pub recipient_link: LinkId,
    /// Link sequencing block
    pub qos: Option<QosBlock>,
    /// Encoded tunnel messages
    pub data: Option<Vec<u8>>,
}

/// Unauthenticated view of a received packet
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader<'a> {
    raw: &'a [u8],
    /// Header flags
    pub flags: u8,
    /// Tunnel id the sender addressed (0 = unknown)
    pub dest_tunnel: u32,
    /// Application id and bootstrap bytes, if present
    pub bootstrap: Option<(u32, &'a [u8])>,
    crc: u32,
    nonce: u32,
    ciphertext: &'a [u8],
}

impl<'a> PacketHeader<'a> {
    /// Parse the cleartext parts of a packet.
    ///
    /// # Errors
    ///
    /// Fails on wrong magic or version, or when the buffer is shorter than
    /// the header, the declared bootstrap, the nonce or one cipher block.
    pub fn parse(data: &'a [u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_SIZE {
            return Err(CodecError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        if data[0] != MAGIC {
            return Err(CodecError::BadMagic(data[0]));
        }
        if data[2] != VERSION {
            return Err(CodecError::BadVersion(data[2]));
        }

        let flags = data[1];
        let crc = u32::from_be_bytes([data[3], data[4], data[5], data[6]]);
        let dest_tunnel = u32::from_be_bytes([data[7], data[8], data[9], data[10]]);

        let mut offset = HEADER_SIZE;
        let bootstrap = if flags & FLAG_BOOTSTRAP != 0 {
            if data.len() < offset + 6 {
                return Err(CodecError::TooShort {
                    expected: offset + 6,
                    actual: data.len(),
                });
            }
            let app_id = u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]);
            let len = usize::from(u16::from_be_bytes([data[offset + 4], data[offset + 5]]));
            offset += 6;
            if data.len() < offset + len {
                return Err(CodecError::TooShort {
                    expected: offset + len,
                    actual: data.len(),
                });
            }
            let blob = &data[offset..offset + len];
            offset += len;
            Some((app_id, blob))
        } else {
            None
        };

        let min = offset + NONCE_SIZE + BLOCK_SIZE;
        if data.len() < min {
            return Err(CodecError::TooShort {
                expected: min,
                actual: data.len(),
            });
        }
        let nonce = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);

        Ok(Self {
            raw: data,
            flags,
            dest_tunnel,
            bootstrap,
            crc,
            nonce,
            ciphertext: &data[offset + NONCE_SIZE..],
        })
    }

    /// Whether the CRC binds this packet to `unique_id`
    #[must_use]
    pub fn verify_crc(&self, unique_id: &PeerUniqueId) -> bool {
        packet_crc(self.raw, unique_id) == self.crc
    }

    /// Wire nonce
    #[must_use]
    pub fn nonce(&self) -> u32 {
        self.nonce
    }
}

/// CRC over `packet` with the CRC field zeroed, continued over `unique_id`
#[must_use]
pub fn packet_crc(packet: &[u8], unique_id: &PeerUniqueId) -> u32 {
    let mut crc = Crc32::new();
    crc.update(&packet[..CRC_OFFSET]);
    crc.update(&[0u8; 4]);
    crc.update(&packet[CRC_OFFSET + 4..]);
    crc.update(unique_id);
    crc.finalize()
}

/// Per-tunnel packet encoder/decoder.
///
/// Holds the tunnel cipher and unique id; the only mutable state is the
/// nonce counter.
#[derive(Debug)]
pub struct PacketCodec {
    cipher: PacketCipher,
    unique_id: PeerUniqueId,
    nonce: u32,
}

impl PacketCodec {
    /// Codec for one tunnel identity
    #[must_use]
    pub fn new(unique_id: PeerUniqueId, secret: &[u8; SECRET_SIZE]) -> Self {
        Self {
            cipher: PacketCipher::new(secret),
            unique_id,
            nonce: plait_crypto::random::random_u32().unwrap_or(1),
        }
    }

    /// Tunnel unique id the codec binds packets to
    #[must_use]
    pub fn unique_id(&self) -> &PeerUniqueId {
        &self.unique_id
    }

    /// Encode and seal a packet.
    ///
    /// # Errors
    ///
    /// Fails when the bootstrap or data block exceeds its 16-bit length, or
    /// when the cipher rejects the body.
    pub fn encode(
        &mut self,
        dest_tunnel: u32,
        bootstrap: Option<(u32, &[u8])>,
        body: &PacketBody,
    ) -> Result<Vec<u8>, CodecError> {
        let plaintext = encode_body(body)?;
        self.nonce = self.nonce.wrapping_add(1);
        let nonce = self.nonce;
        let sealed = self
            .cipher
            .encrypt(nonce, &dest_tunnel.to_be_bytes(), &plaintext)?;

        let boot_len = bootstrap.map_or(0, |(_, b)| 6 + b.len());
        let mut out = Vec::with_capacity(HEADER_SIZE + boot_len + NONCE_SIZE + sealed.len());
        out.push(MAGIC);
        out.push(if bootstrap.is_some() { FLAG_BOOTSTRAP } else { 0 });
        out.push(VERSION);
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&dest_tunnel.to_be_bytes());
        if let Some((app_id, blob)) = bootstrap {
            let len = u16::try_from(blob.len()).map_err(|_| CodecError::Oversize("bootstrap"))?;
            out.extend_from_slice(&app_id.to_be_bytes());
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(blob);
        }
        out.extend_from_slice(&nonce.to_be_bytes());
        out.extend_from_slice(&sealed);

        let crc = packet_crc(&out, &self.unique_id);
        out[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
        Ok(out)
    }

    /// Check the CRC, then decrypt and parse the body.
    ///
    /// # Errors
    ///
    /// [`CodecError::BadCrc`] before any decryption is attempted, then cipher
    /// and truncation errors.
    pub fn open(&self, header: &PacketHeader<'_>) -> Result<PacketBody, CodecError> {
        if !header.verify_crc(&self.unique_id) {
            return Err(CodecError::BadCrc);
        }
        let plaintext =
            self.cipher
                .decrypt(header.nonce, &header.dest_tunnel.to_be_bytes(), header.ciphertext)?;
        decode_body(&plaintext)
    }

    /// Parse and open a raw packet in one step
    ///
    /// # Errors
    ///
    /// See [`PacketHeader::parse`] and [`PacketCodec::open`].
    pub fn decode(&self, data: &[u8]) -> Result<PacketBody, CodecError> {
        let header = PacketHeader::parse(data)?;
        self.open(&header)
    }
}

fn encode_body(body: &PacketBody) -> Result<Vec<u8>, CodecError> {
    let data_len = body.data.as_ref().map_or(0, |d| 2 + d.len());
    let mut out = Vec::with_capacity(BODY_HEADER_SIZE + QOS_SIZE + data_len);

    let mut flags = 0u8;
    if body.qos.is_some() {
        flags |= BODY_QOS;
    }
    if body.data.is_some() {
        flags |= BODY_DATA;
    }
    if body.heartbeat_request {
        flags |= BODY_HB_REQUEST;
    }
    if body.heartbeat_reply {
        flags |= BODY_HB_REPLY;
    }

    out.extend_from_slice(&body.sender_session.as_u64().to_be_bytes());
    out.extend_from_slice(&body.recipient_session.as_u64().to_be_bytes());
    out.push(flags);
    out.extend_from_slice(&body.sender_tunnel.to_be_bytes());
    out.extend_from_slice(&body.sender_link.as_u32().to_be_bytes());
    out.extend_from_slice(&body.recipient_link.as_u32().to_be_bytes());

    if let Some(qos) = body.qos {
        out.extend_from_slice(&qos.sequence.to_be_bytes());
        out.extend_from_slice(&qos.largest.to_be_bytes());
        out.extend_from_slice(&qos.mask.to_be_bytes());
    }
    if let Some(data) = &body.data {
        let len = u16::try_from(data.len()).map_err(|_| CodecError::Oversize("data block"))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(data);
    }
    Ok(out)
}

fn decode_body(plaintext: &[u8]) -> Result<PacketBody, CodecError> {
    let mut r = ByteReader::new(plaintext);
    let sender_session = SessionId::from_u64(r.u64("body header")?);
    let recipient_session = SessionId::from_u64(r.u64("body header")?);
    let flags = r.u8("body header")?;
    let sender_tunnel = r.u32("body header")?;
    let sender_link = LinkId::from_u32(r.u32("body header")?);
    let recipient_link = LinkId::from_u32(r.u32("body header")?);

    let qos = if flags & BODY_QOS != 0 {
        Some(QosBlock {
            sequence: r.u32("qos block")?,
            largest: r.u32("qos block")?,
            mask: r.u64("qos block")?,
        })
    } else {
        None
    };
    let data = if flags & BODY_DATA != 0 {
        let len = usize::from(r.u16("data block")?);
        Some(r.bytes(len, "data block")?.to_vec())
    } else {
        None
    };

    Ok(PacketBody {
        sender_session,
        recipient_session,
        heartbeat_request: flags & BODY_HB_REQUEST != 0,
        heartbeat_reply: flags & BODY_HB_REPLY != 0,
        sender_tunnel,
        sender_link,
        recipient_link,
        qos,
        data,
    })
}

/// Bounds-checked big-endian reader
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(CodecError::Truncated(what))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N, what)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self, what: &'static str) -> Result<u8, CodecError> {
        Ok(self.array::<1>(what)?[0])
    }

    pub(crate) fn u16(&mut self, what: &'static str) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.array(what)?))
    }

    pub(crate) fn u32(&mut self, what: &'static str) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array(what)?))
    }

    pub(crate) fn u64(&mut self, what: &'static str) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.array(what)?))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PacketCodec {
        PacketCodec::new([9u8; 32], &[3u8; SECRET_SIZE])
    }

    fn sample_body() -> PacketBody {
        PacketBody {
            sender_session: SessionId::from_u64(0x1234),
            recipient_session: SessionId::UNKNOWN,
            heartbeat_request: true,
            heartbeat_reply: false,
            sender_tunnel: 77,
            sender_link: LinkId::from_u32(5),
            recipient_link: LinkId::UNKNOWN,
            qos: Some(QosBlock {
                sequence: 10,
                largest: 8,
                mask: 0b1011,
            }),
            data: Some(b"tunnel payload".to_vec()),
        }
    }

    #[test]
    fn test_packet_roundtrip() {
        let mut c = codec();
        let body = sample_body();
        let packet = c.encode(42, None, &body).unwrap();
        let header = PacketHeader::parse(&packet).unwrap();
        assert_eq!(header.dest_tunnel, 42);
        assert!(header.bootstrap.is_none());
        assert_eq!(c.open(&header).unwrap(), body);
    }

    #[test]
    fn test_bootstrap_roundtrip() {
        let mut c = codec();
        let packet = c
            .encode(0, Some((0xA1, b"who am i")), &PacketBody::default())
            .unwrap();
        let header = PacketHeader::parse(&packet).unwrap();
        assert_eq!(header.flags & FLAG_BOOTSTRAP, FLAG_BOOTSTRAP);
        assert_eq!(header.bootstrap, Some((0xA1, &b"who am i"[..])));
        assert_eq!(c.open(&header).unwrap(), PacketBody::default());
    }

    #[test]
    fn test_crc_binds_unique_id() {
        let mut c = codec();
        let packet = c.encode(1, None, &sample_body()).unwrap();
        let header = PacketHeader::parse(&packet).unwrap();
        assert!(header.verify_crc(&[9u8; 32]));
        assert!(!header.verify_crc(&[8u8; 32]));
    }

    #[test]
    fn test_header_tamper_fails_crc() {
        let mut c = codec();
        let mut packet = c.encode(1, None, &sample_body()).unwrap();
        packet[9] ^= 0x40;
        assert_eq!(c.decode(&packet), Err(CodecError::BadCrc));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut c = codec();
        let mut packet = c.encode(1, None, &sample_body()).unwrap();
        packet[0] = 0x00;
        assert_eq!(PacketHeader::parse(&packet).unwrap_err(), CodecError::BadMagic(0));

        let mut packet = c.encode(1, None, &sample_body()).unwrap();
        packet[2] = 9;
        assert_eq!(PacketHeader::parse(&packet).unwrap_err(), CodecError::BadVersion(9));
    }

    #[test]
    fn test_truncated_bootstrap_rejected() {
        let mut c = codec();
        let packet = c
            .encode(0, Some((1, &[7u8; 40])), &PacketBody::default())
            .unwrap();
        assert!(matches!(
            PacketHeader::parse(&packet[..30]),
            Err(CodecError::TooShort { .. })
        ));
    }

    #[test]
    fn test_misaligned_ciphertext_rejected() {
        let mut c = codec();
        let mut packet = c.encode(1, None, &sample_body()).unwrap();
        packet.pop();
        let crc = packet_crc(&packet, &[9u8; 32]);
        packet[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            c.decode(&packet),
            Err(CodecError::Crypto(plait_crypto::CryptoError::Misaligned(_)))
        ));
    }

    #[test]
    fn test_nonce_advances() {
        let mut c = codec();
        let a = c.encode(1, None, &PacketBody::default()).unwrap();
        let b = c.encode(1, None, &PacketBody::default()).unwrap();
        let na = PacketHeader::parse(&a).unwrap().nonce();
        let nb = PacketHeader::parse(&b).unwrap().nonce();
        assert_eq!(nb, na.wrapping_add(1));
    }

    #[test]
    fn test_reader_bounds() {
        let mut r = ByteReader::new(&[1, 2, 3]);
        assert_eq!(r.u16("x").unwrap(), 0x0102);
        assert_eq!(r.u16("x"), Err(CodecError::Truncated("x")));
        assert_eq!(r.u8("x").unwrap(), 3);
        assert!(r.is_empty());
    }
}
