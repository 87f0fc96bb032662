//! X25519 key generation for tunnel peers
//!
//! Produces the same key material as `awg genkey` / `awg pubkey`.

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// Generate a new X25519 keypair from the OS random source
///
/// Returns (private_key, public_key)
pub fn generate_keypair() -> Result<([u8; KEY_LEN], [u8; KEY_LEN]), CryptoError> {
    let mut seed = [0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut seed)
        .map_err(|e| CryptoError::RandomSource {
            reason: e.to_string(),
        })?;
    Ok(keypair_from_seed(seed))
}

/// Build a keypair from 32 bytes of secret material
///
/// The private key is clamped the way `wg genkey` clamps it, so stored keys
/// are byte-identical to what the tunnel tooling would have produced.
pub fn keypair_from_seed(mut seed: [u8; KEY_LEN]) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    seed[0] &= 248;
    seed[31] &= 127;
    seed[31] |= 64;
    let secret = StaticSecret::from(seed);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive public key from private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}
