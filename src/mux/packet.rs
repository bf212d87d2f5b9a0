//! Packet-level transfer
//!
//! A packet is the atomic unit of transfer: a fixed-size AEAD ciphertext
//! followed by its tag. Senders pad to the packet boundary with zero
//! bytes; receivers read and decrypt a whole packet before any frame
//! processing. Multiple frames may share a packet, and a frame may
//! straddle a packet boundary, so the reader exposes the decrypted
//! plaintext as one contiguous byte stream.

use crate::crypto::cipher::{OpenHalf, SealHalf};
use crate::crypto::TAG_LEN;
use crate::mux::frame::{FrameHeader, FRAME_HEADER_SIZE};
use crate::{Error, Result};
use std::io;
use std::ops::Range;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Number of packets the reader buffers at most.
const READ_BUFFER_PACKETS: usize = 10;

/// Reads packets from the transport, decrypts them in place, and scans
/// the plaintext for frames.
pub(crate) struct PacketReader<R> {
    r: R,
    open: OpenHalf,
    packet_size: usize,

    buf: Box<[u8]>,
    /// Decrypted plaintext not yet consumed
    dec: Range<usize>,
    /// Encrypted bytes not yet decrypted; always follows `dec`
    enc: Range<usize>,
    /// Reassembly space for a frame that straddles packets
    scratch: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(r: R, open: OpenHalf, packet_size: usize) -> Self {
        Self {
            r,
            open,
            packet_size,
            buf: vec![0u8; packet_size * READ_BUFFER_PACKETS].into_boxed_slice(),
            dec: 0..0,
            enc: 0..0,
            scratch: Vec::new(),
        }
    }

    fn max_payload_size(&self) -> usize {
        self.packet_size - TAG_LEN - FRAME_HEADER_SIZE
    }

    /// Ensure at least one decrypted byte is available, pulling and
    /// decrypting the next packet if necessary.
    async fn fill(&mut self) -> Result<()> {
        if !self.dec.is_empty() {
            return Ok(());
        }
        if self.enc.len() < self.packet_size {
            // move the partial packet to the front and top it up
            self.buf.copy_within(self.enc.clone(), 0);
            self.enc = 0..self.enc.len();
            self.dec = 0..0;
            while self.enc.len() < self.packet_size {
                let n = self.r.read(&mut self.buf[self.enc.end..]).await?;
                if n == 0 {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                self.enc.end += n;
            }
        }
        let packet = &mut self.buf[self.enc.start..self.enc.start + self.packet_size];
        let plaintext_len = self.open.open_in_place(packet)?.len();
        self.dec = self.enc.start..self.enc.start + plaintext_len;
        self.enc.start += self.packet_size;
        Ok(())
    }

    /// Copy decrypted plaintext into `out`, crossing packet boundaries as
    /// needed.
    async fn read_decrypted(&mut self, out: &mut [u8]) -> Result<()> {
        let mut off = 0;
        while off < out.len() {
            self.fill().await?;
            let n = (out.len() - off).min(self.dec.len());
            out[off..off + n].copy_from_slice(&self.buf[self.dec.start..self.dec.start + n]);
            self.dec.start += n;
            off += n;
        }
        Ok(())
    }

    /// If the next unread byte has a clear low bit, the remainder of the
    /// current packet is padding; discard it.
    fn skip_padding(&mut self) {
        if !self.dec.is_empty() && self.buf[self.dec.start] & 1 == 0 {
            self.dec.start = self.dec.end;
        }
    }

    /// Read the next frame. The returned payload borrows the reader's
    /// internal buffer and is valid only until the next call.
    pub async fn next_frame(&mut self) -> Result<(FrameHeader, &[u8])> {
        self.skip_padding();

        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.read_decrypted(&mut header).await?;
        let h = FrameHeader::decode(&header);
        let len = h.length as usize;
        if len > self.max_payload_size() {
            return Err(Error::Protocol(format!(
                "peer sent too-large frame ({} bytes)",
                h.length
            )));
        }

        if self.dec.len() >= len {
            let payload = &self.buf[self.dec.start..self.dec.start + len];
            self.dec.start += len;
            Ok((h, payload))
        } else {
            // frame straddles a packet boundary; reassemble it
            let mut scratch = std::mem::take(&mut self.scratch);
            scratch.resize(len, 0);
            let result = self.read_decrypted(&mut scratch).await;
            self.scratch = scratch;
            result?;
            Ok((h, &self.scratch[..len]))
        }
    }
}

/// Split `src` (already padded to a multiple of `packet_size - 16`) into
/// packets in `dst`, sealing each in place. Returns the number of bytes
/// of `dst` occupied.
pub(crate) fn encrypt_packets(
    dst: &mut [u8],
    src: &[u8],
    packet_size: usize,
    seal: &mut SealHalf,
) -> usize {
    let max_frame_size = packet_size - TAG_LEN;
    let num_packets = src.len() / max_frame_size;
    for i in 0..num_packets {
        let packet = &mut dst[i * packet_size..(i + 1) * packet_size];
        packet[..max_frame_size]
            .copy_from_slice(&src[i * max_frame_size..(i + 1) * max_frame_size]);
        seal.seal_in_place(packet);
    }
    num_packets * packet_size
}
