//! OS randomness for nonce seeds and session salts.

use crate::CryptoError;

/// Fill `buf` from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS source is unavailable.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|_| CryptoError::RandomFailed)
}

/// Random `u32`; seeds packet nonces and session id salts.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS source is unavailable.
pub fn random_u32() -> Result<u32, CryptoError> {
    let mut buf = [0u8; 4];
    fill_random(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}
