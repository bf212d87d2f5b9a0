//! Key management
//!
//! Identity keys are Ed25519; session keys are derived from an ephemeral
//! X25519 agreement hashed together with both public keys.

use super::{CryptoError, KEY_LEN};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand_core::OsRng;
use zeroize::Zeroizing;

pub use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
pub use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

type Blake2b256 = Blake2b<U32>;

/// The well-known identity derived from an all-zero 32-byte seed.
///
/// Used when the caller has no pre-shared identity; the session is then
/// encrypted but not authenticated.
pub fn anonymous_identity() -> SigningKey {
    SigningKey::from_bytes(&[0u8; 32])
}

/// Generate an ephemeral X25519 keypair for a single handshake.
pub fn generate_x25519_keypair() -> (EphemeralSecret, X25519PublicKey) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = X25519PublicKey::from(&secret);
    (secret, public)
}

/// Derive the session key: BLAKE2b-256 over the shared secret followed by
/// both ephemeral public keys, dialer's first.
///
/// Rejects the exchange if the peer's point was non-contributory (a
/// low-order point would let any observer derive the "secret").
pub fn derive_session_key(
    our_secret: EphemeralSecret,
    their_public: &X25519PublicKey,
    dialer_public: &X25519PublicKey,
    acceptor_public: &X25519PublicKey,
) -> Result<[u8; KEY_LEN], CryptoError> {
    let shared = our_secret.diffie_hellman(their_public);
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributoryKey);
    }
    let shared = Zeroizing::new(*shared.as_bytes());

    let mut hasher = Blake2b256::new();
    hasher.update(shared.as_ref());
    hasher.update(dialer_public.as_bytes());
    hasher.update(acceptor_public.as_bytes());
    Ok(hasher.finalize().into())
}
