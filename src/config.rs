//! Connection settings
//!
//! Both peers advertise their preferred settings during the handshake and
//! install the merged result for the lifetime of the session.

use crate::{Error, Result};
use std::time::Duration;

use crate::crypto::TAG_LEN;
use crate::mux::frame::FRAME_HEADER_SIZE;

/// Encoded size of settings on the wire (packet size + timeout millis)
pub const SETTINGS_SIZE: usize = 4 + 4;

/// Smallest acceptable packet size
pub const MIN_PACKET_SIZE: usize = 1220;

/// Largest acceptable packet size
pub const MAX_PACKET_SIZE: usize = 32768;

/// Shortest acceptable session timeout
pub const MIN_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Longest acceptable session timeout
pub const MAX_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

// 1500-byte Ethernet frame - 40-byte IPv6 header - 20-byte TCP header
const IPV6_MTU: usize = 1440;

/// Negotiated session parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnSettings {
    /// Size of every encrypted packet on the wire, in bytes
    pub packet_size: usize,
    /// Idle interval after which the session is presumed dead; keepalives
    /// are sent at 75% of this value
    pub max_timeout: Duration,
}

impl Default for ConnSettings {
    fn default() -> Self {
        Self {
            packet_size: IPV6_MTU * 3,
            max_timeout: Duration::from_secs(20 * 60),
        }
    }
}

impl ConnSettings {
    /// Usable bytes per packet, before the trailing auth tag
    pub fn max_frame_size(&self) -> usize {
        self.packet_size - TAG_LEN
    }

    /// Largest frame payload that fits in a packet
    pub fn max_payload_size(&self) -> usize {
        self.max_frame_size() - FRAME_HEADER_SIZE
    }

    /// Encode to the 8-byte wire form (all little-endian).
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&(self.packet_size as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&(self.max_timeout.as_millis() as u32).to_le_bytes());
    }

    /// Decode from the 8-byte wire form.
    pub fn decode(buf: &[u8]) -> Self {
        let packet_size = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let millis = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Self {
            packet_size,
            max_timeout: Duration::from_millis(u64::from(millis)),
        }
    }

    /// Merge our settings with the peer's, taking the smaller value for
    /// every parameter, and validate the result against protocol bounds.
    pub fn merge(&self, theirs: &ConnSettings) -> Result<ConnSettings> {
        let merged = ConnSettings {
            packet_size: self.packet_size.min(theirs.packet_size),
            max_timeout: self.max_timeout.min(theirs.max_timeout),
        };
        if merged.packet_size < MIN_PACKET_SIZE {
            return Err(Error::UnacceptableSettings(format!(
                "requested packet size ({}) is too small",
                merged.packet_size
            )));
        } else if merged.packet_size > MAX_PACKET_SIZE {
            return Err(Error::UnacceptableSettings(format!(
                "requested packet size ({}) is too large",
                merged.packet_size
            )));
        } else if merged.max_timeout < MIN_TIMEOUT {
            return Err(Error::UnacceptableSettings(format!(
                "maximum timeout ({:?}) is too short",
                merged.max_timeout
            )));
        } else if merged.max_timeout > MAX_TIMEOUT {
            return Err(Error::UnacceptableSettings(format!(
                "maximum timeout ({:?}) is too long",
                merged.max_timeout
            )));
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let settings = ConnSettings {
            packet_size: 2048,
            max_timeout: Duration::from_secs(300),
        };
        let mut buf = [0u8; SETTINGS_SIZE];
        settings.encode(&mut buf);
        assert_eq!(ConnSettings::decode(&buf), settings);
    }

    #[test]
    fn test_encoding_is_little_endian() {
        let settings = ConnSettings {
            packet_size: 0x0102_0304,
            max_timeout: Duration::from_millis(0x0506_0708),
        };
        let mut buf = [0u8; SETTINGS_SIZE];
        settings.encode(&mut buf);
        assert_eq!(buf, [0x04, 0x03, 0x02, 0x01, 0x08, 0x07, 0x06, 0x05]);
    }

    #[test]
    fn test_merge_takes_minimum() {
        let ours = ConnSettings {
            packet_size: 4320,
            max_timeout: Duration::from_secs(20 * 60),
        };
        let theirs = ConnSettings {
            packet_size: 1220,
            max_timeout: Duration::from_secs(30 * 60),
        };
        let merged = ours.merge(&theirs).unwrap();
        assert_eq!(merged.packet_size, 1220);
        assert_eq!(merged.max_timeout, Duration::from_secs(20 * 60));
    }

    #[test]
    fn test_merge_rejects_out_of_bounds() {
        let ours = ConnSettings::default();

        let tiny = ConnSettings {
            packet_size: 512,
            ..ours
        };
        assert!(matches!(
            ours.merge(&tiny),
            Err(Error::UnacceptableSettings(_))
        ));

        let brief = ConnSettings {
            max_timeout: Duration::from_secs(10),
            ..ours
        };
        assert!(matches!(
            ours.merge(&brief),
            Err(Error::UnacceptableSettings(_))
        ));

        // an oversized advertisement merges down to ours, which is valid
        let huge = ConnSettings {
            packet_size: MAX_PACKET_SIZE * 2,
            max_timeout: Duration::from_secs(3 * 60 * 60),
        };
        let merged = ours.merge(&huge).unwrap();
        assert_eq!(merged, ours);
    }

    #[test]
    fn test_payload_size_accounts_for_overhead() {
        let settings = ConnSettings::default();
        assert_eq!(settings.max_frame_size(), settings.packet_size - 16);
        assert_eq!(settings.max_payload_size(), settings.packet_size - 16 - 8);
    }
}
