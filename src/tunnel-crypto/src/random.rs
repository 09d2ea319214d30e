//! Handshake random values.
//!
//! A hello random is 32 bytes on the wire: a 4-byte big-endian GMT unix time
//! followed by 28 bytes from the secure RNG.

use crate::rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Length of the fixed encoding of a handshake random.
pub const RANDOM_LENGTH: usize = 32;
/// Length of the random-bytes portion of a handshake random.
pub const RANDOM_BYTES_LENGTH: usize = RANDOM_LENGTH - 4;

/// Random value exchanged in the client and server hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeRandom {
    /// Seconds since the unix epoch, as carried in the first four bytes
    pub gmt_unix_time: u32,
    /// Random portion
    pub random_bytes: [u8; RANDOM_BYTES_LENGTH],
}

impl HandshakeRandom {
    /// Generate a fresh random stamped with the current time.
    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        Self {
            // Truncation is the wire behaviour once the 32-bit clock wraps.
            gmt_unix_time: now as u32,
            random_bytes: rng::random_array(),
        }
    }

    /// Fixed 32-byte encoding.
    pub fn marshal_fixed(&self) -> [u8; RANDOM_LENGTH] {
        let mut out = [0u8; RANDOM_LENGTH];
        out[..4].copy_from_slice(&self.gmt_unix_time.to_be_bytes());
        out[4..].copy_from_slice(&self.random_bytes);
        out
    }

    /// Decode the fixed 32-byte encoding.
    pub fn unmarshal_fixed(data: &[u8; RANDOM_LENGTH]) -> Self {
        let mut random_bytes = [0u8; RANDOM_BYTES_LENGTH];
        random_bytes.copy_from_slice(&data[4..]);
        Self {
            gmt_unix_time: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            random_bytes,
        }
    }

    /// True until a value has been generated or received.
    pub fn is_zero(&self) -> bool {
        self.gmt_unix_time == 0 && self.random_bytes.iter().all(|&b| b == 0)
    }
}
