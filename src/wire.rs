//! Wire-level constants and byte layouts.
//!
//! Two dictionaries cross the lower transport, keyed by the constants below.
//! `ResetComplete`'s value is a fixed 6-byte array; `Chunk`'s value is a 4-byte
//! header followed by payload bytes. Neither uses serde — both are small enough
//! to hand-encode, and the header packs a flag bit into the high bit of `n`.

/// Lowest protocol version this build understands.
pub const MIN_VERSION: u8 = 1;
/// Highest protocol version this build understands.
pub const MAX_VERSION: u8 = 1;
/// Largest chunk payload we will ever emit.
pub const MAX_TX_CHUNK_SIZE: u16 = 1000;
/// Largest chunk payload we are willing to receive.
pub const MAX_RX_CHUNK_SIZE: u16 = 1000;

/// Maximum consecutive transport failures for one unit (control message or chunk)
/// before it is abandoned.
pub const MAX_FAILURES: u8 = 3;
/// Fixed retry backoff.
pub const RETRY_BACKOFF_MS: u64 = 1000;

pub const KEY_RESET_REQUEST: &str = "ResetRequest";
pub const KEY_RESET_COMPLETE: &str = "ResetComplete";
pub const KEY_CHUNK: &str = "Chunk";
pub const KEY_UNSUPPORTED_ERROR: &str = "UnsupportedError";

/// Largest value `n` can carry in the 4-byte chunk header (31 bits).
pub const MAX_CHUNK_N: u32 = 0x7fff_ffff;

/// Our own capability set, as encoded in the `ResetComplete` we send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCapabilities {
    pub min_version: u8,
    pub max_version: u8,
    pub max_tx_chunk_size: u16,
    pub max_rx_chunk_size: u16,
}

impl Default for LocalCapabilities {
    fn default() -> Self {
        Self {
            min_version: MIN_VERSION,
            max_version: MAX_VERSION,
            max_tx_chunk_size: MAX_TX_CHUNK_SIZE,
            max_rx_chunk_size: MAX_RX_CHUNK_SIZE,
        }
    }
}

impl LocalCapabilities {
    pub fn encode(&self) -> [u8; 6] {
        [
            self.min_version,
            self.max_version,
            (self.max_tx_chunk_size >> 8) as u8,
            (self.max_tx_chunk_size & 0xff) as u8,
            (self.max_rx_chunk_size >> 8) as u8,
            (self.max_rx_chunk_size & 0xff) as u8,
        ]
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 6 {
            return None;
        }
        Some(Self {
            min_version: bytes[0],
            max_version: bytes[1],
            max_tx_chunk_size: u16::from_be_bytes([bytes[2], bytes[3]]),
            max_rx_chunk_size: u16::from_be_bytes([bytes[4], bytes[5]]),
        })
    }

    /// Negotiate session parameters against a remote's advertised capabilities.
    /// `None` if the version ranges do not overlap.
    pub fn negotiate(&self, remote: &LocalCapabilities) -> Option<(u8, u16, u16)> {
        if self.max_version < remote.min_version || remote.max_version < self.min_version {
            return None;
        }
        let version = self.max_version.min(remote.max_version);
        let tx_chunk_size = self.max_tx_chunk_size.min(remote.max_rx_chunk_size);
        let rx_chunk_size = self.max_rx_chunk_size.min(remote.max_tx_chunk_size);
        Some((version, tx_chunk_size, rx_chunk_size))
    }
}

/// A decoded chunk header: `is_first` plus the 31-bit `n` field, which is
/// either the total message length (first chunk) or the byte offset
/// (continuation chunk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub is_first: bool,
    pub n: u32,
}

impl ChunkHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let n = self.n & MAX_CHUNK_N;
        out.push((n & 0xff) as u8);
        out.push(((n >> 8) & 0xff) as u8);
        out.push(((n >> 16) & 0xff) as u8);
        let top = ((n >> 24) & 0x7f) as u8 | if self.is_first { 0x80 } else { 0x00 };
        out.push(top);
    }

    pub fn decode(bytes: &[u8]) -> Option<(Self, &[u8])> {
        if bytes.len() < 4 {
            return None;
        }
        let is_first = bytes[3] & 0x80 != 0;
        let n = (bytes[0] as u32)
            | ((bytes[1] as u32) << 8)
            | ((bytes[2] as u32) << 16)
            | (((bytes[3] & 0x7f) as u32) << 24);
        Some((Self { is_first, n }, &bytes[4..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_round_trip() {
        let caps = LocalCapabilities {
            min_version: 1,
            max_version: 1,
            max_tx_chunk_size: 1000,
            max_rx_chunk_size: 1000,
        };
        let encoded = caps.encode();
        assert_eq!(encoded, [1, 1, 0x03, 0xE8, 0x03, 0xE8]);
        assert_eq!(LocalCapabilities::decode(&encoded), Some(caps));
    }

    #[test]
    fn negotiate_picks_minimum_of_each_field() {
        let local = LocalCapabilities::default();
        let remote = LocalCapabilities {
            min_version: 1,
            max_version: 1,
            max_tx_chunk_size: 500,
            max_rx_chunk_size: 2000,
        };
        let (version, tx, rx) = local.negotiate(&remote).unwrap();
        assert_eq!(version, 1);
        assert_eq!(tx, 500);
        assert_eq!(rx, 1000);
    }

    #[test]
    fn negotiate_fails_on_disjoint_version_ranges() {
        let local = LocalCapabilities::default();
        let remote = LocalCapabilities {
            min_version: 2,
            max_version: 3,
            max_tx_chunk_size: 1000,
            max_rx_chunk_size: 1000,
        };
        assert!(local.negotiate(&remote).is_none());
    }

    #[test]
    fn header_round_trip_first_chunk() {
        let header = ChunkHeader {
            is_first: true,
            n: 8,
        };
        let mut bytes = Vec::new();
        header.encode(&mut bytes);
        assert_eq!(bytes, vec![0x08, 0x00, 0x00, 0x80]);
        let (decoded, rest) = ChunkHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert!(rest.is_empty());
    }

    #[test]
    fn header_round_trip_continuation_chunk() {
        let header = ChunkHeader {
            is_first: false,
            n: 1000,
        };
        let mut bytes = Vec::new();
        header.encode(&mut bytes);
        bytes.extend_from_slice(b"payload");
        let (decoded, rest) = ChunkHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(rest, b"payload");
    }

    #[test]
    fn decode_rejects_short_buffers() {
        assert!(ChunkHeader::decode(&[0, 0, 0]).is_none());
    }
}
