//! Sequenced AEAD cipher
//!
//! Each session direction owns an independent AEAD state whose 96-bit
//! nonce is a little-endian counter advanced after every packet. The
//! dialer's outbound nonces count up from zero; the acceptor's count up
//! from 1 << 95, so the two directions can never collide under one key.

use super::handshake::HandshakeRole;
use super::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use aes_gcm::Aes128Gcm;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;

/// AEAD negotiated by peer protocol version: ChaCha20-Poly1305 for
/// version 3, AES-128-GCM (using the first half of the derived key) for
/// version 4 and later.
pub enum SessionAead {
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    Aes128Gcm(Box<Aes128Gcm>),
}

impl SessionAead {
    pub fn new(key: &[u8; KEY_LEN], peer_version: u8) -> Result<Self, CryptoError> {
        if peer_version == 3 {
            let aead = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| CryptoError::Cipher(e.to_string()))?;
            Ok(SessionAead::ChaCha20Poly1305(Box::new(aead)))
        } else {
            let aead = Aes128Gcm::new_from_slice(&key[..16])
                .map_err(|e| CryptoError::Cipher(e.to_string()))?;
            Ok(SessionAead::Aes128Gcm(Box::new(aead)))
        }
    }

    fn seal_detached(&self, nonce: &[u8; NONCE_LEN], buf: &mut [u8]) -> [u8; TAG_LEN] {
        let nonce = GenericArray::from_slice(nonce);
        let tag = match self {
            SessionAead::ChaCha20Poly1305(aead) => {
                aead.encrypt_in_place_detached(nonce, &[], buf)
            }
            SessionAead::Aes128Gcm(aead) => aead.encrypt_in_place_detached(nonce, &[], buf),
        }
        .expect("aead seal cannot fail for in-bounds plaintext");
        tag.into()
    }

    fn open_detached(
        &self,
        nonce: &[u8; NONCE_LEN],
        buf: &mut [u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<(), CryptoError> {
        let nonce = GenericArray::from_slice(nonce);
        let tag = GenericArray::from_slice(tag);
        match self {
            SessionAead::ChaCha20Poly1305(aead) => {
                aead.decrypt_in_place_detached(nonce, &[], buf, tag)
            }
            SessionAead::Aes128Gcm(aead) => aead.decrypt_in_place_detached(nonce, &[], buf, tag),
        }
        .map_err(|_| CryptoError::AuthFailure)
    }
}

fn advance_nonce(nonce: &mut [u8; NONCE_LEN]) {
    let counter = u64::from_le_bytes(nonce[..8].try_into().unwrap());
    nonce[..8].copy_from_slice(&counter.wrapping_add(1).to_le_bytes());
}

/// Outbound half of a session cipher.
pub struct SealHalf {
    aead: SessionAead,
    nonce: [u8; NONCE_LEN],
}

impl SealHalf {
    /// Seal `buf[..len-16]` in place and write the tag into the trailing
    /// 16 bytes, then advance the nonce.
    pub fn seal_in_place(&mut self, buf: &mut [u8]) {
        let plaintext_len = buf.len() - TAG_LEN;
        let (plaintext, tag_region) = buf.split_at_mut(plaintext_len);
        let tag = self.aead.seal_detached(&self.nonce, plaintext);
        tag_region.copy_from_slice(&tag);
        advance_nonce(&mut self.nonce);
    }
}

/// Inbound half of a session cipher.
pub struct OpenHalf {
    aead: SessionAead,
    nonce: [u8; NONCE_LEN],
}

impl OpenHalf {
    /// Verify and decrypt `buf` (ciphertext followed by a 16-byte tag) in
    /// place, returning the plaintext slice. The nonce advances whether or
    /// not the tag verifies; a failure is fatal to the session.
    pub fn open_in_place<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a [u8], CryptoError> {
        let ciphertext_len = buf.len() - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&buf[ciphertext_len..]);
        let result = self
            .aead
            .open_detached(&self.nonce, &mut buf[..ciphertext_len], &tag);
        advance_nonce(&mut self.nonce);
        result?;
        Ok(&buf[..ciphertext_len])
    }
}

/// A pair of per-direction AEAD states established by the handshake.
pub struct SeqCipher {
    seal: SealHalf,
    open: OpenHalf,
}

impl SeqCipher {
    pub fn new(
        key: &[u8; KEY_LEN],
        peer_version: u8,
        role: HandshakeRole,
    ) -> Result<Self, CryptoError> {
        let mut seal_nonce = [0u8; NONCE_LEN];
        let mut open_nonce = [0u8; NONCE_LEN];
        match role {
            HandshakeRole::Initiator => open_nonce[NONCE_LEN - 1] ^= 0x80,
            HandshakeRole::Responder => seal_nonce[NONCE_LEN - 1] ^= 0x80,
        }
        Ok(Self {
            seal: SealHalf {
                aead: SessionAead::new(key, peer_version)?,
                nonce: seal_nonce,
            },
            open: OpenHalf {
                aead: SessionAead::new(key, peer_version)?,
                nonce: open_nonce,
            },
        })
    }

    pub fn seal_in_place(&mut self, buf: &mut [u8]) {
        self.seal.seal_in_place(buf)
    }

    pub fn open_in_place<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a [u8], CryptoError> {
        self.open.open_in_place(buf)
    }

    /// Split into independently owned halves for the writer and reader
    /// workers.
    pub fn split(self) -> (SealHalf, OpenHalf) {
        (self.seal, self.open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(peer_version: u8) -> (SeqCipher, SeqCipher) {
        let key = [0x42u8; KEY_LEN];
        let dialer = SeqCipher::new(&key, peer_version, HandshakeRole::Initiator).unwrap();
        let acceptor = SeqCipher::new(&key, peer_version, HandshakeRole::Responder).unwrap();
        (dialer, acceptor)
    }

    #[test]
    fn test_roundtrip_both_ciphers() {
        for version in [3u8, 4, 5] {
            let (mut dialer, mut acceptor) = pair(version);

            let mut buf = Vec::from(&b"hello, sealed world"[..]);
            buf.extend_from_slice(&[0u8; TAG_LEN]);
            dialer.seal_in_place(&mut buf);
            assert_ne!(&buf[..5], b"hello");

            let plaintext = acceptor.open_in_place(&mut buf).unwrap();
            assert_eq!(plaintext, b"hello, sealed world");
        }
    }

    #[test]
    fn test_nonce_sequencing() {
        let (mut dialer, mut acceptor) = pair(4);

        // several packets in order
        for i in 0u8..4 {
            let mut buf = vec![i; 32 + TAG_LEN];
            dialer.seal_in_place(&mut buf);
            let plaintext = acceptor.open_in_place(&mut buf).unwrap();
            assert_eq!(plaintext, &[i; 32]);
        }
    }

    #[test]
    fn test_replay_is_rejected() {
        let (mut dialer, mut acceptor) = pair(4);

        let mut buf = vec![1u8; 32 + TAG_LEN];
        dialer.seal_in_place(&mut buf);
        let replay = buf.clone();
        acceptor.open_in_place(&mut buf).unwrap();

        // the acceptor's nonce has advanced, so the same packet no longer opens
        let mut replay = replay;
        assert!(matches!(
            acceptor.open_in_place(&mut replay),
            Err(CryptoError::AuthFailure)
        ));
    }

    #[test]
    fn test_tamper_detection() {
        let (mut dialer, mut acceptor) = pair(3);

        let mut buf = vec![7u8; 64 + TAG_LEN];
        dialer.seal_in_place(&mut buf);
        buf[10] ^= 0x01;
        assert!(matches!(
            acceptor.open_in_place(&mut buf),
            Err(CryptoError::AuthFailure)
        ));
    }

    #[test]
    fn test_directions_are_independent() {
        let (mut dialer, mut acceptor) = pair(4);

        // acceptor -> dialer uses the high nonce partition; sealing the
        // same plaintext in each direction yields different ciphertext
        let mut a = vec![9u8; 16 + TAG_LEN];
        let mut b = a.clone();
        dialer.seal_in_place(&mut a);
        acceptor.seal_in_place(&mut b);
        assert_ne!(a, b);

        let plaintext = dialer.open_in_place(&mut b).unwrap();
        assert_eq!(plaintext, &[9u8; 16]);
    }
}
