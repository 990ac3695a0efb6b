//! # PLAIT Crypto
//!
//! Cryptographic primitives for the PLAIT tunneling transport.
//!
//! This crate provides:
//! - CRC-32 with continuation, used to bind packet headers to a tunnel identity
//! - Block-aligned packet encryption keyed by a 16-byte tunnel secret
//! - Secure random number generation
//!
//! ## Primitive Suite
//!
//! | Function | Algorithm | Notes |
//! |----------|-----------|-------|
//! | Header binding | CRC-32 (IEEE, reflected) | continued over the tunnel unique id |
//! | Key expansion | BLAKE3 `derive_key` | 16-byte secret to 32-byte key |
//! | Packet body | XChaCha20-Poly1305 | padded to 16-byte blocks |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cipher;
pub mod crc;
pub mod error;
pub mod random;

pub use cipher::PacketCipher;
pub use crc::Crc32;
pub use error::CryptoError;

/// Tunnel secret size
pub const SECRET_SIZE: usize = 16;

/// Cipher block size; ciphertext is always a multiple of this
pub const BLOCK_SIZE: usize = 16;

/// Tunnel unique id size
pub const UNIQUE_ID_SIZE: usize = 32;
