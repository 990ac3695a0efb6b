//! Block-aligned packet encryption.
//!
//! Every packet body is sealed under the tunnel's 16-byte secret. The secret
//! is expanded into two independent 32-byte keys with BLAKE3 `derive_key`:
//! one seals the body with `XChaCha20-Poly1305`, the other derives the
//! 192-bit nonce from the 32-bit wire nonce and a caller-supplied context
//! (the destination tunnel id).
//!
//! Plaintext is padded ISO/IEC 7816-4 style (`0x80` then zeros) to a whole
//! number of [`BLOCK_SIZE`] blocks. The Poly1305 tag is itself one block, so
//! ciphertext length is always a positive multiple of the block size and
//! receivers can reject misaligned input before touching the cipher.

use crate::{BLOCK_SIZE, CryptoError, SECRET_SIZE};
use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Authentication tag size (one block).
pub const TAG_SIZE: usize = 16;

/// Smallest valid ciphertext: one padded block plus the tag.
pub const MIN_CIPHERTEXT: usize = BLOCK_SIZE + TAG_SIZE;

const SEAL_CONTEXT: &str = "plait 2024-06 packet seal key";
const NONCE_CONTEXT: &str = "plait 2024-06 packet nonce key";

/// Packet cipher bound to one tunnel secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PacketCipher {
    seal_key: [u8; 32],
    nonce_key: [u8; 32],
}

impl PacketCipher {
    /// Expand a tunnel secret into a packet cipher
    #[must_use]
    pub fn new(secret: &[u8; SECRET_SIZE]) -> Self {
        Self {
            seal_key: blake3::derive_key(SEAL_CONTEXT, secret),
            nonce_key: blake3::derive_key(NONCE_CONTEXT, secret),
        }
    }

    fn derive_nonce(&self, nonce: u32, context: &[u8]) -> XNonce {
        let mut hasher = blake3::Hasher::new_keyed(&self.nonce_key);
        hasher.update(&nonce.to_be_bytes());
        hasher.update(context);
        let hash = hasher.finalize();
        XNonce::clone_from_slice(&hash.as_bytes()[..24])
    }

    /// Pad and seal `plaintext`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the AEAD rejects the input.
    pub fn encrypt(&self, nonce: u32, context: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let padded_len = (plaintext.len() / BLOCK_SIZE + 1) * BLOCK_SIZE;
        let mut padded = Vec::with_capacity(padded_len + TAG_SIZE);
        padded.extend_from_slice(plaintext);
        padded.push(0x80);
        padded.resize(padded_len, 0);

        let aead = XChaCha20Poly1305::new(Key::from_slice(&self.seal_key));
        let sealed = aead
            .encrypt(
                &self.derive_nonce(nonce, context),
                Payload {
                    msg: &padded,
                    aad: context,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed);
        padded.zeroize();
        sealed
    }

    /// Open and unpad `ciphertext`.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Misaligned`] if the length is not a positive block multiple
    /// - [`CryptoError::DecryptionFailed`] if authentication fails
    /// - [`CryptoError::InvalidPadding`] if the recovered padding is malformed
    pub fn decrypt(&self, nonce: u32, context: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < MIN_CIPHERTEXT || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::Misaligned(ciphertext.len()));
        }

        let aead = XChaCha20Poly1305::new(Key::from_slice(&self.seal_key));
        let mut plaintext = aead
            .decrypt(
                &self.derive_nonce(nonce, context),
                Payload {
                    msg: ciphertext,
                    aad: context,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let marker = plaintext
            .iter()
            .rposition(|&b| b != 0)
            .ok_or(CryptoError::InvalidPadding)?;
        if plaintext[marker] != 0x80 || plaintext.len() - marker > BLOCK_SIZE {
            return Err(CryptoError::InvalidPadding);
        }
        plaintext.truncate(marker);
        Ok(plaintext)
    }
}

impl std::fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> PacketCipher {
        PacketCipher::new(&[7u8; SECRET_SIZE])
    }

    #[test]
    fn test_roundtrip_various_lengths() {
        let c = cipher();
        for len in [0usize, 1, 15, 16, 17, 100, 1400] {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let sealed = c.encrypt(42, b"ctx", &plaintext).unwrap();
            assert_eq!(sealed.len() % BLOCK_SIZE, 0);
            assert_eq!(c.decrypt(42, b"ctx", &sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let c = cipher();
        let sealed = c.encrypt(1, b"ctx", b"secret payload").unwrap();
        assert_eq!(c.decrypt(2, b"ctx", &sealed), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_wrong_context_fails() {
        let c = cipher();
        let sealed = c.encrypt(1, b"ctx-a", b"secret payload").unwrap();
        assert!(c.decrypt(1, b"ctx-b", &sealed).is_err());
    }

    #[test]
    fn test_wrong_secret_fails() {
        let sealed = cipher().encrypt(9, b"", b"hello").unwrap();
        let other = PacketCipher::new(&[8u8; SECRET_SIZE]);
        assert!(other.decrypt(9, b"", &sealed).is_err());
    }

    #[test]
    fn test_misaligned_rejected_early() {
        let c = cipher();
        let mut sealed = c.encrypt(1, b"", b"abc").unwrap();
        sealed.pop();
        assert_eq!(c.decrypt(1, b"", &sealed), Err(CryptoError::Misaligned(sealed.len())));
        assert!(matches!(c.decrypt(1, b"", &[]), Err(CryptoError::Misaligned(0))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let c = cipher();
        let mut sealed = c.encrypt(5, b"", b"tamper me").unwrap();
        sealed[3] ^= 0x01;
        assert_eq!(c.decrypt(5, b"", &sealed), Err(CryptoError::DecryptionFailed));
    }

    proptest::proptest! {
        #[test]
        fn prop_seal_open_any_length(
            plaintext in proptest::collection::vec(proptest::num::u8::ANY, 0..2048),
            nonce: u32,
            tunnel: u32,
        ) {
            let c = cipher();
            let context = tunnel.to_be_bytes();
            let sealed = c.encrypt(nonce, &context, &plaintext).unwrap();
            proptest::prop_assert_eq!(sealed.len() % BLOCK_SIZE, 0);
            proptest::prop_assert!(sealed.len() >= plaintext.len() + 1 + TAG_SIZE);
            proptest::prop_assert_eq!(c.decrypt(nonce, &context, &sealed).unwrap(), plaintext);
        }

        #[test]
        fn prop_any_flipped_byte_is_rejected(
            plaintext in proptest::collection::vec(proptest::num::u8::ANY, 0..512),
            position: proptest::sample::Index,
            flip in 1u8..=255,
        ) {
            let c = cipher();
            let mut sealed = c.encrypt(3, b"ctx", &plaintext).unwrap();
            let at = position.index(sealed.len());
            sealed[at] ^= flip;
            proptest::prop_assert_eq!(c.decrypt(3, b"ctx", &sealed), Err(CryptoError::DecryptionFailed));
        }
    }
}
