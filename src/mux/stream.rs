//! Multiplexed stream implementation

use super::frame::{FrameHeader, FLAG_ERROR, FLAG_FIRST, FLAG_LAST};
use super::multiplexer::MuxShared;
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::{self, Instant};

/// State shared between a stream handle, the mux workers, and any
/// cancellation watcher. Guarded by its own mutex; the notify is
/// broadcast to both readers and the frame-delivery side.
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    pub(crate) state: Mutex<StreamState>,
    pub(crate) notify: Notify,
}

pub(crate) struct StreamState {
    /// Whether the first frame has been sent (or, for peer-initiated
    /// streams, received)
    pub(crate) established: bool,
    /// Sticky terminal error
    pub(crate) err: Option<Error>,
    /// Bytes delivered by the reader, not yet consumed by `read`
    pub(crate) read_buf: BytesMut,
    /// Read deadline
    pub(crate) rd: Option<Instant>,
    /// Write deadline
    pub(crate) wd: Option<Instant>,
}

impl StreamShared {
    pub(crate) fn new(id: u32, established: bool, err: Option<Error>) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(StreamState {
                established,
                err,
                read_buf: BytesMut::new(),
                rd: None,
                wd: None,
            }),
            notify: Notify::new(),
        })
    }

    /// Set the stream's terminal error and wake every waiter.
    pub(crate) fn terminate(&self, err: Error) {
        {
            let mut st = self.state.lock().unwrap();
            st.err = Some(err);
        }
        self.notify.notify_waiters();
    }

    /// Deliver a frame payload and wait until `read` calls have drained
    /// it (or the stream errored, or the read deadline expired). The mux
    /// reader must not advance to the next frame until this returns.
    pub(crate) async fn consume_payload(&self, payload: &[u8]) {
        {
            let mut st = self.state.lock().unwrap();
            st.read_buf.clear();
            st.read_buf.extend_from_slice(payload);
        }
        self.notify.notify_waiters();

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let deadline = {
                let st = self.state.lock().unwrap();
                if st.read_buf.is_empty() || st.err.is_some() {
                    return;
                }
                match st.rd {
                    Some(d) if d <= Instant::now() => return,
                    d => d,
                }
            };
            match deadline {
                Some(d) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = time::sleep_until(d) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// A bidirectional byte stream multiplexed over a session.
///
/// Created by [`Mux::dial_stream`](super::Mux::dial_stream) (no I/O; the
/// peer learns of the stream on the first write) or returned by
/// [`Mux::accept_stream`](super::Mux::accept_stream).
pub struct Stream {
    shared: Arc<StreamShared>,
    mux: Arc<MuxShared>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, mux: Arc<MuxShared>) -> Self {
        Self { shared, mux }
    }

    pub(crate) fn shared_handle(&self) -> Arc<StreamShared> {
        self.shared.clone()
    }

    /// Stream identifier within the session.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Local address of the underlying transport, if it has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mux.local_addr
    }

    /// Remote address of the underlying transport, if it has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.mux.remote_addr
    }

    /// Set both the read and write deadlines.
    ///
    /// Setting a deadline does not affect pending `read` or `write`
    /// calls, only future ones. Expiry is not terminal: the stream
    /// remains usable.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut st = self.shared.state.lock().unwrap();
        st.rd = deadline;
        st.wd = deadline;
    }

    /// Set the read deadline. Applies to future `read` calls only.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.state.lock().unwrap().rd = deadline;
    }

    /// Set the write deadline. Applies to future `write` calls only.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.state.lock().unwrap().wd = deadline;
    }

    /// Read data from the stream. Returns `Ok(0)` once the peer has
    /// gracefully closed its side and all delivered bytes are consumed.
    ///
    /// # Panics
    ///
    /// Panics if called on a locally-dialed stream before the first
    /// `write`: the peer cannot know the stream exists yet, so such a
    /// read could never complete.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let deadline = {
            let st = self.shared.state.lock().unwrap();
            if !st.established {
                panic!("read called before write on newly dialed stream");
            }
            st.rd
        };
        if let Some(d) = deadline {
            if d <= Instant::now() {
                return Err(Error::DeadlineExceeded);
            }
        }

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.shared.state.lock().unwrap();
                if let Some(err) = &st.err {
                    return match err {
                        Error::PeerClosedStream => Ok(0),
                        err => Err(err.clone()),
                    };
                }
                if let Some(d) = deadline {
                    if d <= Instant::now() {
                        return Err(Error::DeadlineExceeded);
                    }
                }
                if !st.read_buf.is_empty() {
                    let n = buf.len().min(st.read_buf.len());
                    buf[..n].copy_from_slice(&st.read_buf[..n]);
                    st.read_buf.advance(n);
                    drop(st);
                    // wake the reader waiting for the buffer to drain
                    self.shared.notify.notify_waiters();
                    return Ok(n);
                }
            }
            match deadline {
                Some(d) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = time::sleep_until(d) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Write data to the stream, chunking it into frames. The first
    /// frame of the stream carries the flag that creates the stream on
    /// the peer.
    ///
    /// A successful return means the data was accepted into the session's
    /// write buffer, not that the peer received it.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let max_payload = self.mux.settings.max_payload_size();
        let mut written = 0;
        while written < buf.len() {
            let (flags, deadline) = {
                let mut st = self.shared.state.lock().unwrap();
                if let Some(err) = &st.err {
                    return Err(err.clone());
                }
                let mut flags = 0;
                if !st.established {
                    st.established = true;
                    flags = FLAG_FIRST;
                }
                (flags, st.wd)
            };
            let end = buf.len().min(written + max_payload);
            let payload = &buf[written..end];
            let h = FrameHeader {
                id: self.shared.id,
                length: payload.len() as u16,
                flags,
            };
            self.mux.buffer_frame(h, payload, deadline).await?;
            written = end;
        }
        Ok(written)
    }

    /// Close the stream gracefully. The underlying connection is not
    /// closed. Closing an already-closed stream is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.close_inner(None).await
    }

    /// Close the stream and convey `reason` to the peer, whose pending
    /// and future operations on the stream will fail with that exact
    /// message.
    pub async fn close_with_error(&self, reason: &str) -> Result<()> {
        self.close_inner(Some(reason)).await
    }

    async fn close_inner(&self, reason: Option<&str>) -> Result<()> {
        // interrupt outstanding read/write calls; a concurrent write may
        // still buffer another frame before observing the close, which is
        // fine: the peer discards frames that arrive after the last one
        let wd = {
            let mut st = self.shared.state.lock().unwrap();
            if matches!(
                st.err,
                Some(Error::ClosedStream) | Some(Error::PeerClosedStream)
            ) {
                return Ok(());
            }
            st.err = Some(Error::ClosedStream);
            st.wd
        };
        self.shared.notify.notify_waiters();

        let (flags, payload) = match reason {
            Some(reason) => (FLAG_LAST | FLAG_ERROR, reason.as_bytes()),
            None => (FLAG_LAST, &[][..]),
        };
        let payload = &payload[..payload.len().min(self.mux.settings.max_payload_size())];
        let h = FrameHeader {
            id: self.shared.id,
            length: payload.len() as u16,
            flags,
        };
        match self.mux.buffer_frame(h, payload, wd).await {
            Err(err) if !matches!(err, Error::PeerClosedStream) => return Err(err),
            _ => {}
        }

        self.mux.remove_stream(self.shared.id);
        Ok(())
    }
}
