//! Authenticated session handshake
//!
//! Performed over the raw transport before any packet traffic:
//!
//! 1. Both sides exchange a one-byte protocol version.
//! 2. Both sides generate ephemeral X25519 keys; the dialer sends its
//!    public key.
//! 3. The acceptor derives the session key, signs the key-exchange
//!    transcript with its Ed25519 identity, and responds with its public
//!    key, the signature, and its AEAD-sealed settings.
//! 4. The dialer verifies the signature against the expected identity,
//!    derives the same key, and answers with its own sealed settings.
//!
//! Both sides install the merged settings as the session parameters.

use super::cipher::SeqCipher;
use super::keys::{
    derive_session_key, generate_x25519_keypair, Signature, Signer, SigningKey, Verifier,
    VerifyingKey, X25519PublicKey,
};
use super::{CryptoError, TAG_LEN};
use crate::config::{ConnSettings, SETTINGS_SIZE};
use crate::{Error, Result, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Role in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Dialing peer
    Initiator,
    /// Accepting peer
    Responder,
}

const PUBKEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;
const SEALED_SETTINGS_LEN: usize = SETTINGS_SIZE + TAG_LEN;
const RESPONSE_LEN: usize = PUBKEY_LEN + SIGNATURE_LEN + SEALED_SETTINGS_LEN;

/// Initiate a handshake as the dialing peer.
pub(crate) async fn initiate<T>(
    conn: &mut T,
    their_key: &VerifyingKey,
    our_settings: ConnSettings,
) -> Result<(SeqCipher, ConnSettings)>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    initiate_with_version(conn, their_key, our_settings, PROTOCOL_VERSION).await
}

/// Reciprocate a handshake as the accepting peer.
pub(crate) async fn accept<T>(
    conn: &mut T,
    our_key: &SigningKey,
    our_settings: ConnSettings,
) -> Result<(SeqCipher, ConnSettings)>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    accept_with_version(conn, our_key, our_settings, PROTOCOL_VERSION).await
}

pub(crate) async fn initiate_with_version<T>(
    conn: &mut T,
    their_key: &VerifyingKey,
    our_settings: ConnSettings,
    our_version: u8,
) -> Result<(SeqCipher, ConnSettings)>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    conn.write_all(&[our_version]).await?;
    let mut version = [0u8; 1];
    conn.read_exact(&mut version).await?;
    let cipher_version = check_version(version[0], our_version)?;

    let (xsk, xpk) = generate_x25519_keypair();
    conn.write_all(xpk.as_bytes()).await?;

    // pubkey, signature, and sealed settings in one response
    let mut buf = [0u8; RESPONSE_LEN];
    conn.read_exact(&mut buf).await?;

    let mut rxpk = [0u8; PUBKEY_LEN];
    rxpk.copy_from_slice(&buf[..PUBKEY_LEN]);
    let rxpk = X25519PublicKey::from(rxpk);

    let mut msg = [0u8; PUBKEY_LEN * 2];
    msg[..PUBKEY_LEN].copy_from_slice(xpk.as_bytes());
    msg[PUBKEY_LEN..].copy_from_slice(rxpk.as_bytes());
    let sig = Signature::from_slice(&buf[PUBKEY_LEN..PUBKEY_LEN + SIGNATURE_LEN])
        .map_err(|_| CryptoError::InvalidSignature)?;
    their_key
        .verify(&msg, &sig)
        .map_err(|_| CryptoError::InvalidSignature)?;

    let key = derive_session_key(xsk, &rxpk, &xpk, &rxpk)?;
    let mut cipher = SeqCipher::new(&key, cipher_version, HandshakeRole::Initiator)?;

    let sealed = &mut buf[PUBKEY_LEN + SIGNATURE_LEN..];
    let plaintext = cipher.open_in_place(sealed)?;
    let merged = our_settings.merge(&ConnSettings::decode(plaintext))?;

    let mut settings_buf = [0u8; SEALED_SETTINGS_LEN];
    our_settings.encode(&mut settings_buf[..SETTINGS_SIZE]);
    cipher.seal_in_place(&mut settings_buf);
    conn.write_all(&settings_buf).await?;

    Ok((cipher, merged))
}

pub(crate) async fn accept_with_version<T>(
    conn: &mut T,
    our_key: &SigningKey,
    our_settings: ConnSettings,
    our_version: u8,
) -> Result<(SeqCipher, ConnSettings)>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut version = [0u8; 1];
    conn.read_exact(&mut version).await?;
    conn.write_all(&[our_version]).await?;
    let cipher_version = check_version(version[0], our_version)?;

    let mut rxpk = [0u8; PUBKEY_LEN];
    conn.read_exact(&mut rxpk).await?;
    let rxpk = X25519PublicKey::from(rxpk);

    let (xsk, xpk) = generate_x25519_keypair();
    let key = derive_session_key(xsk, &rxpk, &rxpk, &xpk)?;
    let mut cipher = SeqCipher::new(&key, cipher_version, HandshakeRole::Responder)?;

    let mut msg = [0u8; PUBKEY_LEN * 2];
    msg[..PUBKEY_LEN].copy_from_slice(rxpk.as_bytes());
    msg[PUBKEY_LEN..].copy_from_slice(xpk.as_bytes());
    let sig = our_key.sign(&msg);

    let mut buf = [0u8; RESPONSE_LEN];
    buf[..PUBKEY_LEN].copy_from_slice(xpk.as_bytes());
    buf[PUBKEY_LEN..PUBKEY_LEN + SIGNATURE_LEN].copy_from_slice(&sig.to_bytes());
    our_settings
        .encode(&mut buf[PUBKEY_LEN + SIGNATURE_LEN..PUBKEY_LEN + SIGNATURE_LEN + SETTINGS_SIZE]);
    cipher.seal_in_place(&mut buf[PUBKEY_LEN + SIGNATURE_LEN..]);
    conn.write_all(&buf).await?;

    let mut settings_buf = [0u8; SEALED_SETTINGS_LEN];
    conn.read_exact(&mut settings_buf).await?;
    let plaintext = cipher.open_in_place(&mut settings_buf)?;
    let merged = our_settings.merge(&ConnSettings::decode(plaintext))?;

    Ok((cipher, merged))
}

/// Validate the peer's version byte and pick the version that governs the
/// session cipher (the lower of the two: version 3 peers only speak
/// ChaCha20-Poly1305).
fn check_version(theirs: u8, ours: u8) -> Result<u8> {
    if theirs == 0 {
        return Err(Error::Protocol("peer sent invalid version".into()));
    } else if theirs < MIN_PROTOCOL_VERSION {
        return Err(Error::UnsupportedVersion(theirs));
    }
    Ok(theirs.min(ours))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::anonymous_identity;
    use std::time::Duration;

    async fn run_pair(
        dialer_settings: ConnSettings,
        acceptor_settings: ConnSettings,
        version: u8,
    ) -> (
        Result<(SeqCipher, ConnSettings)>,
        Result<(SeqCipher, ConnSettings)>,
    ) {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let identity = anonymous_identity();
        let pubkey = identity.verifying_key();
        tokio::join!(
            initiate_with_version(&mut a, &pubkey, dialer_settings, version),
            accept_with_version(&mut b, &identity, acceptor_settings, version),
        )
    }

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let (dialed, accepted) = run_pair(
            ConnSettings::default(),
            ConnSettings::default(),
            PROTOCOL_VERSION,
        )
        .await;
        let (mut dialer_cipher, dialer_settings) = dialed.unwrap();
        let (mut acceptor_cipher, acceptor_settings) = accepted.unwrap();
        assert_eq!(dialer_settings, acceptor_settings);

        // the session ciphers line up in both directions
        let mut buf = vec![3u8; 100 + TAG_LEN];
        dialer_cipher.seal_in_place(&mut buf);
        assert_eq!(
            acceptor_cipher.open_in_place(&mut buf).unwrap(),
            &[3u8; 100]
        );
        let mut buf = vec![4u8; 100 + TAG_LEN];
        acceptor_cipher.seal_in_place(&mut buf);
        assert_eq!(dialer_cipher.open_in_place(&mut buf).unwrap(), &[4u8; 100]);
    }

    #[tokio::test]
    async fn test_handshake_merges_settings() {
        let small = ConnSettings {
            packet_size: 1400,
            max_timeout: Duration::from_secs(30 * 60),
        };
        let (dialed, accepted) = run_pair(ConnSettings::default(), small, PROTOCOL_VERSION).await;
        let (_, dialer_settings) = dialed.unwrap();
        let (_, acceptor_settings) = accepted.unwrap();
        assert_eq!(dialer_settings.packet_size, 1400);
        assert_eq!(dialer_settings.max_timeout, Duration::from_secs(20 * 60));
        assert_eq!(dialer_settings, acceptor_settings);
    }

    #[tokio::test]
    async fn test_handshake_version_3_uses_chacha() {
        let (dialed, accepted) =
            run_pair(ConnSettings::default(), ConnSettings::default(), 3).await;
        let (mut dialer_cipher, _) = dialed.unwrap();
        let (mut acceptor_cipher, _) = accepted.unwrap();

        let mut buf = vec![9u8; 32 + TAG_LEN];
        dialer_cipher.seal_in_place(&mut buf);
        assert_eq!(acceptor_cipher.open_in_place(&mut buf).unwrap(), &[9u8; 32]);
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_identity() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let identity = anonymous_identity();
        let wrong_key = SigningKey::from_bytes(&[9u8; 32]).verifying_key();
        let (dialed, _) = tokio::join!(
            initiate(&mut a, &wrong_key, ConnSettings::default()),
            accept(&mut b, &identity, ConnSettings::default()),
        );
        assert!(matches!(
            dialed,
            Err(Error::Crypto(CryptoError::InvalidSignature))
        ));
    }

    #[tokio::test]
    async fn test_handshake_rejects_old_version() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let identity = anonymous_identity();
        let pubkey = identity.verifying_key();
        let (dialed, accepted) = tokio::join!(
            initiate_with_version(&mut a, &pubkey, ConnSettings::default(), 2),
            accept(&mut b, &identity, ConnSettings::default()),
        );
        assert!(matches!(accepted, Err(Error::UnsupportedVersion(2))));
        // the acceptor hangs up, so the dialer sees either the version
        // error or a short read
        assert!(dialed.is_err());
    }

    #[tokio::test]
    async fn test_handshake_rejects_unacceptable_settings() {
        let tiny = ConnSettings {
            packet_size: 600,
            max_timeout: Duration::from_secs(20 * 60),
        };
        let (dialed, _) = run_pair(ConnSettings::default(), tiny, PROTOCOL_VERSION).await;
        assert!(matches!(dialed, Err(Error::UnacceptableSettings(_))));
    }
}
