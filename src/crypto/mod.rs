//! Cryptographic layer
//!
//! This module provides:
//! - X25519 key agreement and Ed25519 identity proofs for the handshake
//! - BLAKE2b-256 session key derivation
//! - Per-direction sequenced AEAD (ChaCha20-Poly1305 or AES-128-GCM)

pub mod cipher;
pub mod handshake;
pub mod keys;

pub use cipher::{SeqCipher, SessionAead};
pub use handshake::HandshakeRole;

use thiserror::Error;

/// Length of symmetric key material in bytes
pub const KEY_LEN: usize = 32;

/// Length of an AEAD nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of an AEAD authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    #[error("authentication failure")]
    AuthFailure,

    #[error("peer sent a non-contributory key exchange point")]
    NonContributoryKey,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("cipher error: {0}")]
    Cipher(String),
}
