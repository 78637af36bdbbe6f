//! Transport-level encoding.
//!
//! A serialized [`Message`](crate::protocol::Message) travels as one or more
//! frames:
//!
//! ```text
//! +-----------+--------------+------------+--------------+-----------+---------+
//! | magic (4) | total_len(8) | sequence(4)| slice_len(2) | slice ... | crc (4) |
//! +-----------+--------------+------------+--------------+-----------+---------+
//! ```
//!
//! All integers are big-endian. The CRC32 covers every byte before it. When a
//! secret is configured the whole encoded frame, trailer included, is XORed
//! with a single key byte (see [`Scrambler`]); that is obfuscation, not
//! encryption.

pub mod cursor;
pub mod frame;
pub mod scramble;

pub use cursor::{WireReader, WireWriter};
pub use frame::{
    read_frame, Frame, FrameHeader, DEFAULT_SLICE_SIZE, FRAME_MAGIC, HEADER_LEN, MAX_MESSAGE_SIZE,
    MAX_SLICE_SIZE, TRAILER_LEN,
};
pub use scramble::Scrambler;

use thiserror::Error;

/// Everything that can be wrong with bytes received from a peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("declared message length {0} is not positive")]
    NonPositiveLength(i64),

    #[error("declared message length {len} exceeds maximum {max}")]
    MessageTooLarge { len: i64, max: usize },

    #[error("invalid slice length {0}")]
    InvalidSliceLength(i16),

    #[error("frame sequence {actual} out of order, expected {expected}")]
    OutOfSequence { expected: i32, actual: i32 },

    #[error("missing frame sequence {0}")]
    MissingSequence(i32),

    #[error("duplicate frame sequence {0}")]
    DuplicateSequence(i32),

    #[error("frame length mismatch: header says {expected}, got {actual}")]
    LengthMismatch { expected: i64, actual: i64 },

    #[error("truncated {field}: need {need} bytes, have {have}")]
    Truncated {
        field: &'static str,
        need: usize,
        have: usize,
    },

    #[error("negative length prefix {len} for {field}")]
    NegativeLength { field: &'static str, len: i32 },

    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("invalid {field} value {value}")]
    InvalidValue { field: &'static str, value: u8 },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("checksum mismatch: frame carries {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl FrameError {
    /// CRC failures are reported as integrity errors, everything else as framing errors.
    pub fn is_integrity(&self) -> bool {
        matches!(self, FrameError::ChecksumMismatch { .. })
    }
}

/// CRC32 (IEEE) of a byte slice.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
