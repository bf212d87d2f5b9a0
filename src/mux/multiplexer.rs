//! Session multiplexer
//!
//! A `Mux` owns the transport and two worker tasks. The writer drains a
//! bounded, mux-global write buffer into encrypted packets; the reader
//! decrypts packets and routes frames to per-stream buffers, blocking on
//! each stream until its payload is consumed. All shared state lives
//! under one mutex with two wake groups: `cond` (broadcast: writer work,
//! acceptable streams, flush completion) and `buffer_space` (single-wake:
//! space freed in the write buffer).

use super::frame::{
    append_frame, FrameHeader, FLAG_ERROR, FLAG_FIRST, FLAG_LAST, FRAME_HEADER_SIZE, ID_KEEPALIVE,
};
use super::packet::{encrypt_packets, PacketReader};
use super::stream::{Stream, StreamShared};
use super::{ID_LOWEST_STREAM, ID_WRAP_POINT, MAX_STREAMS};
use crate::config::ConnSettings;
use crate::crypto::cipher::{OpenHalf, SealHalf, SeqCipher};
use crate::crypto::handshake::{self, HandshakeRole};
use crate::crypto::keys::{anonymous_identity, SigningKey, VerifyingKey};
use crate::transport::Transport;
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub(crate) struct StreamEntry {
    pub(crate) shared: Arc<StreamShared>,
    pub(crate) need_accept: bool,
}

pub(crate) struct MuxState {
    pub(crate) streams: HashMap<u32, StreamEntry>,
    pub(crate) next_id: u32,
    /// Sticky and fatal
    pub(crate) err: Option<Error>,
    pub(crate) write_buf: Vec<u8>,
    /// Whether the writer is mid-flush; `close` waits for both an empty
    /// buffer and a finished flush before tearing the transport down
    pub(crate) writing: bool,
}

pub(crate) struct MuxShared {
    pub(crate) settings: ConnSettings,
    pub(crate) state: Mutex<MuxState>,
    /// General wake: buffered frames for the writer, acceptable streams,
    /// flush completion
    pub(crate) cond: Notify,
    /// Wakes a single waiter when write-buffer space frees up
    pub(crate) buffer_space: Notify,
    pub(crate) shutdown: CancellationToken,
    /// Counts stream-table removals; the reader uses it to revalidate its
    /// cached stream pointer
    pub(crate) removals: AtomicU64,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) remote_addr: Option<SocketAddr>,
}

impl MuxShared {
    pub(crate) fn new(
        settings: ConnSettings,
        role: HandshakeRole,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Arc<Self> {
        let next_id = match role {
            // dialing peers use even ids, accepting peers odd ones
            HandshakeRole::Initiator => ID_LOWEST_STREAM,
            HandshakeRole::Responder => ID_LOWEST_STREAM | 1,
        };
        Arc::new(MuxShared {
            settings,
            state: Mutex::new(MuxState {
                streams: HashMap::new(),
                next_id,
                err: None,
                write_buf: Vec::with_capacity(settings.max_frame_size() * 10),
                writing: false,
            }),
            cond: Notify::new(),
            buffer_space: Notify::new(),
            shutdown: CancellationToken::new(),
            removals: AtomicU64::new(0),
            local_addr,
            remote_addr,
        })
    }

    /// Set the mux error and wake every waiter. If the error is already
    /// set, returns the existing one.
    pub(crate) fn set_err(&self, err: Error) -> Error {
        let mut st = self.state.lock().unwrap();
        if let Some(existing) = &st.err {
            return existing.clone();
        }
        let err = if err.is_conn_close() {
            Error::PeerClosedConn
        } else {
            err
        };
        debug!(%err, "mux shutting down");
        st.err = Some(err.clone());
        for entry in st.streams.values() {
            entry.shared.terminate(err.clone());
        }
        drop(st);
        // cancelling makes the workers exit and drop the transport halves,
        // which closes the connection
        self.shutdown.cancel();
        self.cond.notify_waiters();
        self.buffer_space.notify_waiters();
        err
    }

    /// Block until the frame fits in the write buffer, then append it and
    /// wake the writer. Fails early if the mux errors or the deadline
    /// expires; an expired deadline leaves no partial frame behind.
    pub(crate) async fn buffer_frame(
        &self,
        h: FrameHeader,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<()> {
        if let Some(d) = deadline {
            if d <= Instant::now() {
                return Err(Error::DeadlineExceeded);
            }
        }
        let max_buf_size = self.settings.max_payload_size() * 10;
        loop {
            let notified = self.buffer_space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().unwrap();
                if let Some(err) = &st.err {
                    return Err(err.clone());
                }
                if let Some(d) = deadline {
                    if d <= Instant::now() {
                        return Err(Error::DeadlineExceeded);
                    }
                }
                if st.write_buf.len() + FRAME_HEADER_SIZE + payload.len() <= max_buf_size {
                    append_frame(&mut st.write_buf, h, payload);
                    drop(st);
                    self.cond.notify_waiters();
                    // wake at most one other buffer_frame call; waking the
                    // "wrong" one (whose payload still doesn't fit) only
                    // delays it until the next flush, whereas waking all of
                    // them stampedes the lock under heavy concurrency
                    self.buffer_space.notify_one();
                    return Ok(());
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

    pub(crate) fn remove_stream(&self, id: u32) {
        let mut st = self.state.lock().unwrap();
        if st.streams.remove(&id).is_some() {
            self.removals.fetch_add(1, Ordering::Release);
        }
    }
}

/// A `Mux` multiplexes multiple duplex [`Stream`]s onto a single
/// transport.
///
/// Dropping the mux tears the session down; streams outstanding at that
/// point fail with [`Error::ClosedConn`].
pub struct Mux {
    shared: Arc<MuxShared>,
}

impl Mux {
    /// Initiate a protocol handshake on `conn`, authenticating the peer
    /// against `their_key`.
    pub async fn dial<T: Transport>(mut conn: T, their_key: VerifyingKey) -> Result<Mux> {
        let (cipher, settings) =
            handshake::initiate(&mut conn, &their_key, ConnSettings::default()).await?;
        Ok(Mux::start(conn, cipher, settings, HandshakeRole::Initiator))
    }

    /// Reciprocate a protocol handshake on `conn`, proving `our_key` to
    /// the peer.
    pub async fn accept<T: Transport>(mut conn: T, our_key: SigningKey) -> Result<Mux> {
        let (cipher, settings) =
            handshake::accept(&mut conn, &our_key, ConnSettings::default()).await?;
        Ok(Mux::start(conn, cipher, settings, HandshakeRole::Responder))
    }

    /// Initiate a handshake to a party without a pre-established
    /// identity. The counterparty must reciprocate with
    /// [`accept_anonymous`](Mux::accept_anonymous). The session is
    /// encrypted but not authenticated.
    pub async fn dial_anonymous<T: Transport>(conn: T) -> Result<Mux> {
        Mux::dial(conn, anonymous_identity().verifying_key()).await
    }

    /// Reciprocate a handshake without a pre-established identity. The
    /// counterparty must initiate with
    /// [`dial_anonymous`](Mux::dial_anonymous).
    pub async fn accept_anonymous<T: Transport>(conn: T) -> Result<Mux> {
        Mux::accept(conn, anonymous_identity()).await
    }

    /// Wire up shared state and spawn the worker tasks.
    fn start<T: Transport>(
        conn: T,
        cipher: SeqCipher,
        settings: ConnSettings,
        role: HandshakeRole,
    ) -> Mux {
        let shared = MuxShared::new(settings, role, conn.local_addr(), conn.remote_addr());
        let (seal, open) = cipher.split();
        let (read_half, write_half) = tokio::io::split(conn);
        tokio::spawn(read_loop(shared.clone(), read_half, open));
        tokio::spawn(write_loop(shared.clone(), write_half, seal));
        Mux { shared }
    }

    /// Create a new outgoing [`Stream`].
    ///
    /// This performs no I/O; the peer is unaware of the stream until the
    /// first `write`. Succeeds even on an errored mux: the returned
    /// stream then carries the mux's terminal error.
    pub fn dial_stream(&self) -> Stream {
        let mut st = self.shared.state.lock().unwrap();
        let id = st.next_id;
        st.next_id += 2;
        if st.next_id >= ID_WRAP_POINT {
            // preserve the dial/accept parity bit
            st.next_id = ID_LOWEST_STREAM | (st.next_id & 1);
        }
        let stream = StreamShared::new(id, false, st.err.clone());
        st.streams.insert(
            id,
            StreamEntry {
                shared: stream.clone(),
                need_accept: false,
            },
        );
        Stream::new(stream, self.shared.clone())
    }

    /// Like [`dial_stream`](Mux::dial_stream), but ties the stream to a
    /// cancellation token: when the token fires, pending and future calls
    /// on the stream fail with [`Error::Cancelled`] (unless the stream is
    /// already errored). Spawns a helper task whose lifetime matches the
    /// token's.
    pub fn dial_stream_cancellable(&self, token: CancellationToken) -> Stream {
        let stream = self.dial_stream();
        let shared = stream.shared_handle();
        tokio::spawn(async move {
            token.cancelled().await;
            let mut st = shared.state.lock().unwrap();
            if st.err.is_none() {
                st.err = Some(Error::Cancelled);
                drop(st);
                shared.notify.notify_waiters();
            }
        });
        stream
    }

    /// Wait for and return the next peer-initiated [`Stream`].
    ///
    /// Acceptance order of concurrently opened streams is unspecified.
    pub async fn accept_stream(&self) -> Result<Stream> {
        loop {
            let notified = self.shared.cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.shared.state.lock().unwrap();
                if let Some(err) = &st.err {
                    return Err(err.clone());
                }
                if let Some(entry) = st.streams.values_mut().find(|e| e.need_accept) {
                    entry.need_accept = false;
                    return Ok(Stream::new(entry.shared.clone(), self.shared.clone()));
                }
            }
            notified.await;
        }
    }

    /// Close the session: wait for buffered frames to reach the
    /// transport, then tear it down. Idempotent; a session already closed
    /// by either side reports success.
    pub async fn close(&self) -> Result<()> {
        loop {
            let notified = self.shared.cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.shared.state.lock().unwrap();
                if st.err.is_some() || (st.write_buf.is_empty() && !st.writing) {
                    break;
                }
            }
            notified.await;
        }
        match self.shared.set_err(Error::ClosedConn) {
            Error::ClosedConn | Error::PeerClosedConn => Ok(()),
            err => Err(err),
        }
    }

    /// Number of live entries in the stream table.
    pub fn stream_count(&self) -> usize {
        self.shared.state.lock().unwrap().streams.len()
    }

    /// Local address of the underlying transport, if it has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Remote address of the underlying transport, if it has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.shared.set_err(Error::ClosedConn);
    }
}

/// Drains the write buffer into encrypted packets. Also emits keepalives
/// whenever the session has been idle for 75% of the negotiated timeout.
async fn write_loop<W: AsyncWrite + Unpin>(
    shared: Arc<MuxShared>,
    mut conn: W,
    mut seal: SealHalf,
) {
    let keepalive_interval = shared.settings.max_timeout - shared.settings.max_timeout / 4;
    let packet_size = shared.settings.packet_size;
    let max_frame_size = shared.settings.max_frame_size();
    // local scratch so buffer_frame isn't blocked while we encrypt and
    // write
    let mut scratch = vec![0u8; packet_size * 10];
    let mut next_keepalive = Instant::now() + keepalive_interval;

    loop {
        // wait for frames, an error, or the keepalive deadline
        loop {
            let notified = shared.cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = shared.state.lock().unwrap();
                if st.err.is_some() {
                    return;
                }
                if !st.write_buf.is_empty() {
                    break;
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = time::sleep_until(next_keepalive) => break,
            }
        }

        let n = {
            let mut st = shared.state.lock().unwrap();
            if st.err.is_some() {
                return;
            }
            // woken by the keepalive timer with nothing to send
            if st.write_buf.is_empty() {
                trace!("sending keepalive");
                append_frame(&mut st.write_buf, FrameHeader::KEEPALIVE, &[]);
            }
            // pad to the packet boundary
            if st.write_buf.len() % max_frame_size != 0 {
                let padded =
                    st.write_buf.len() + max_frame_size - st.write_buf.len() % max_frame_size;
                st.write_buf.resize(padded, 0);
            }
            let n = encrypt_packets(&mut scratch, &st.write_buf, packet_size, &mut seal);
            st.write_buf.clear();
            st.writing = true;
            n
        };
        // space just freed; wake one buffered writer while we hit the wire
        shared.buffer_space.notify_one();

        next_keepalive = Instant::now() + keepalive_interval;
        let result = tokio::select! {
            r = conn.write_all(&scratch[..n]) => r,
            _ = shared.shutdown.cancelled() => return,
        };
        shared.state.lock().unwrap().writing = false;
        shared.cond.notify_waiters();
        if let Err(err) = result {
            shared.set_err(err.into());
            return;
        }
    }
}

/// Routes incoming frames to their streams, creating streams as the peer
/// opens them. Blocks on each stream until the frame's payload is fully
/// consumed, since the payload occupies the packet reader's buffer.
async fn read_loop<R: AsyncRead + Unpin>(shared: Arc<MuxShared>, conn: R, open: OpenHalf) {
    let mut pr = PacketReader::new(conn, open, shared.settings.packet_size);
    // saves a lock acquisition and map lookup on a run of frames to the
    // same stream; revalidated against the mux's removal counter
    let mut cached: Option<Arc<StreamShared>> = None;
    let mut cache_gen = shared.removals.load(Ordering::Acquire);

    loop {
        let (h, payload) = {
            let result = tokio::select! {
                res = pr.next_frame() => res,
                _ = shared.shutdown.cancelled() => return,
            };
            match result {
                Ok(frame) => frame,
                Err(err) => {
                    shared.set_err(err);
                    return;
                }
            }
        };

        if h.id == ID_KEEPALIVE {
            continue;
        } else if h.id < ID_LOWEST_STREAM {
            shared.set_err(Error::Protocol(format!(
                "peer sent invalid frame id ({}) (length={}, flags={})",
                h.id, h.length, h.flags
            )));
            return;
        }

        let gen = shared.removals.load(Ordering::Acquire);
        if gen != cache_gen {
            cached = None;
            cache_gen = gen;
        }
        let stream = match &cached {
            Some(stream) if stream.id == h.id => stream.clone(),
            _ => {
                let mut st = shared.state.lock().unwrap();
                if st.err.is_some() {
                    return;
                }
                if let Some(entry) = st.streams.get(&h.id) {
                    let stream = entry.shared.clone();
                    drop(st);
                    cached = Some(stream.clone());
                    stream
                } else if h.flags & FLAG_FIRST == 0 {
                    // unknown id and not a new stream: we already tore the
                    // stream down on this side, so in-flight frames for it
                    // are benign
                    trace!(id = h.id, "dropping frame for closed stream");
                    continue;
                } else {
                    if st.streams.len() > MAX_STREAMS {
                        drop(st);
                        shared.set_err(Error::TooManyStreams(MAX_STREAMS));
                        return;
                    }
                    let stream = StreamShared::new(h.id, true, None);
                    st.streams.insert(
                        h.id,
                        StreamEntry {
                            shared: stream.clone(),
                            need_accept: true,
                        },
                    );
                    drop(st);
                    cached = Some(stream.clone());
                    // wake accept_stream
                    shared.cond.notify_waiters();
                    stream
                }
            }
        };

        if h.flags & FLAG_LAST != 0 {
            let err = if h.flags & FLAG_ERROR != 0 {
                Error::PeerError(String::from_utf8_lossy(payload).into_owned())
            } else {
                Error::PeerClosedStream
            };
            stream.terminate(err);
            shared.remove_stream(h.id);
            cached = None;
        } else {
            stream.consume_payload(payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn idle_mux() -> Mux {
        Mux {
            shared: MuxShared::new(ConnSettings::default(), HandshakeRole::Initiator, None, None),
        }
    }

    #[tokio::test]
    async fn test_write_buffer_is_bounded() {
        let mux = idle_mux();
        let shared = &mux.shared;
        let max_payload = shared.settings.max_payload_size();
        let bound = max_payload * 10;
        let payload = vec![0u8; max_payload];
        let h = FrameHeader {
            id: 256,
            length: max_payload as u16,
            flags: 0,
        };

        // no writer is draining, so the buffer fills to its bound and the
        // next frame blocks until the deadline
        let mut buffered = 0;
        loop {
            let deadline = Instant::now() + Duration::from_millis(10);
            match shared.buffer_frame(h, &payload, Some(deadline)).await {
                Ok(()) => buffered += 1,
                Err(Error::DeadlineExceeded) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
            assert!(buffered < 11, "buffer exceeded its bound");
        }
        let len = shared.state.lock().unwrap().write_buf.len();
        assert!(len <= bound);
        assert!(buffered >= 9);
    }

    #[test]
    fn test_stream_id_wraparound() {
        let mux = idle_mux();
        mux.shared.state.lock().unwrap().next_id = ID_WRAP_POINT - 2;
        let stream = mux.dial_stream();
        assert_eq!(stream.id(), ID_WRAP_POINT - 2);
        // the counter wrapped back to the reserved boundary, keeping the
        // dialer's parity
        let next = mux.shared.state.lock().unwrap().next_id;
        assert_eq!(next, ID_LOWEST_STREAM | ((ID_WRAP_POINT - 2) & 1));
    }

    #[tokio::test]
    async fn test_keepalives_flow_on_idle_session() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let key = [5u8; 32];
        let dial_cipher = SeqCipher::new(&key, 4, HandshakeRole::Initiator).unwrap();
        let accept_cipher = SeqCipher::new(&key, 4, HandshakeRole::Responder).unwrap();
        // a short timeout so several keepalive intervals elapse while idle
        let settings = ConnSettings {
            packet_size: 1220,
            max_timeout: Duration::from_millis(200),
        };
        let dialed = Mux::start(a, dial_cipher, settings, HandshakeRole::Initiator);
        let accepted = Mux::start(b, accept_cipher, settings, HandshakeRole::Responder);

        tokio::time::sleep(Duration::from_millis(600)).await;

        // keepalives kept the session healthy; a fresh stream still works
        let stream = dialed.dial_stream();
        stream.write(b"still alive").await.unwrap();
        let peer = accepted.accept_stream().await.unwrap();
        let mut buf = [0u8; 11];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still alive");
    }

    #[tokio::test]
    async fn test_errored_mux_rejects_frames() {
        let mux = idle_mux();
        mux.shared.set_err(Error::ClosedConn);
        let h = FrameHeader {
            id: 256,
            length: 1,
            flags: 0,
        };
        assert!(matches!(
            mux.shared.buffer_frame(h, b"x", None).await,
            Err(Error::ClosedConn)
        ));
        // dialing still succeeds, but the stream is born errored
        let stream = mux.dial_stream();
        assert!(matches!(
            stream.write(b"x").await,
            Err(Error::ClosedConn)
        ));
    }
}
