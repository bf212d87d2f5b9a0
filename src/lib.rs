//! # SiaMux
//!
//! A multiplexer for many independent bidirectional byte streams over a
//! single ordered, reliable transport (typically TCP).
//!
//! ## Features
//!
//! - **End-to-end encryption** with an authenticated X25519 + Ed25519
//!   handshake (ChaCha20-Poly1305 or AES-128-GCM record protection)
//! - **Fixed-size encrypted packets**: a passive observer cannot infer
//!   stream boundaries, counts, or payload sizes beyond packet granularity
//! - **Lightweight streams**: opening a stream performs no I/O; the peer
//!   learns of it with the first write
//! - **Bounded write buffering** with fair backpressure across streams
//! - **Keepalives and deadlines** without per-stream timers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Stream API                          │
//! │        (read / write / close / deadlines)           │
//! ├─────────────────────────────────────────────────────┤
//! │                 Mux runtime                         │
//! │   (stream table, write buffer, reader + writer)     │
//! ├─────────────────────────────────────────────────────┤
//! │                 Packet layer                        │
//! │      (framing, padding, sequenced AEAD)             │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport                           │
//! │          (TCP or any duplex byte channel)           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use siamux::Mux;
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> siamux::Result<()> {
//!     let conn = TcpStream::connect("127.0.0.1:9999").await.unwrap();
//!     let mux = Mux::dial_anonymous(conn).await?;
//!
//!     let stream = mux.dial_stream();
//!     stream.write(b"hello").await?;
//!     let mut buf = [0u8; 64];
//!     let n = stream.read(&mut buf).await?;
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//!
//!     stream.close().await?;
//!     mux.close().await
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod mux;
pub mod transport;

pub use config::ConnSettings;
pub use crypto::keys::{anonymous_identity, SigningKey, VerifyingKey};
pub use mux::{Mux, Stream};
pub use transport::Transport;

use std::io;
use std::sync::Arc;

/// Highest protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u8 = 4;

/// Lowest peer protocol version this implementation accepts.
pub const MIN_PROTOCOL_VERSION: u8 = 3;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
///
/// The mux's terminal error is sticky and shared with every stream and
/// blocked caller, so this type is `Clone`; I/O errors are held behind an
/// `Arc` for that reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("peer protocol version {0} is not supported")]
    UnsupportedVersion(u8),

    #[error("peer sent unacceptable settings: {0}")]
    UnacceptableSettings(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("exceeded concurrent stream limit ({0} streams)")]
    TooManyStreams(usize),

    #[error("underlying connection was closed")]
    ClosedConn,

    #[error("peer closed underlying connection")]
    PeerClosedConn,

    #[error("stream was gracefully closed")]
    ClosedStream,

    #[error("peer closed stream gracefully")]
    PeerClosedStream,

    #[error("{0}")]
    PeerError(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("stream was cancelled")]
    Cancelled,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Whether this error indicates that the peer closed the underlying
    /// connection out from under us (EOF, reset, abort).
    pub(crate) fn is_conn_close(&self) -> bool {
        match self {
            Error::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}
