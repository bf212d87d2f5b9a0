//! Transport abstraction
//!
//! The mux runs over any connected, reliable, ordered duplex byte channel.
//! Implementations only add address metadata on top of tokio's I/O traits;
//! the mux never dials or listens itself.

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// A duplex byte channel the mux can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Local address of the underlying channel, if it has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Remote address of the underlying channel, if it has one.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Transport for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// In-memory pipe, mainly for tests.
impl Transport for DuplexStream {}
