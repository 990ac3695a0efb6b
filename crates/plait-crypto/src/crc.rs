//! CRC-32 with continuation.
//!
//! Packet headers are bound to a tunnel by computing the CRC over the packet
//! (with the CRC field zeroed) and then continuing the same register over the
//! 32-byte tunnel unique id. A receiver that does not know the id cannot
//! produce or check a valid value.

/// Reflected IEEE 802.3 polynomial
const POLY: u32 = 0xEDB8_8320;

const TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Incremental CRC-32 (IEEE) hasher
#[derive(Debug, Clone, Copy)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    /// Start a new checksum
    #[must_use]
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    /// Feed more bytes into the running checksum
    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.state;
        for &byte in data {
            crc = TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8);
        }
        self.state = crc;
    }

    /// Builder form of [`Crc32::update`]
    #[must_use]
    pub fn chain(mut self, data: &[u8]) -> Self {
        self.update(data);
        self
    }

    /// Final checksum value
    #[must_use]
    pub fn finalize(&self) -> u32 {
        !self.state
    }

    /// One-shot checksum of a buffer
    #[must_use]
    pub fn checksum(data: &[u8]) -> u32 {
        Self::new().chain(data).finalize()
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}
