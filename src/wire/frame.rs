//! Frame encoding, fragmentation and reassembly.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{checksum, FrameError, Scrambler};
use crate::error::Result;

pub const FRAME_MAGIC: [u8; 4] = *b"DSYF";

/// magic + total length + sequence + slice length
pub const HEADER_LEN: usize = 4 + 8 + 4 + 2;

/// CRC32 trailer
pub const TRAILER_LEN: usize = 4;

/// Slice length travels as an `i16`.
pub const MAX_SLICE_SIZE: usize = i16::MAX as usize;

pub const DEFAULT_SLICE_SIZE: usize = 16 * 1024;

/// Upper bound for one reassembled message (64MB), checked before buffering.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// One transport-level slice of a serialized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Length of the complete serialized message
    pub total_length: i64,
    /// 0-based position of this slice
    pub sequence: i32,
    pub data: Bytes,
}

/// Parsed fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub total_length: i64,
    pub sequence: i32,
    pub slice_length: usize,
}

impl FrameHeader {
    pub fn parse(mut header: &[u8]) -> std::result::Result<Self, FrameError> {
        if header.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                field: "frame header",
                need: HEADER_LEN,
                have: header.len(),
            });
        }
        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let total_length = header.get_i64();
        let sequence = header.get_i32();
        let raw_slice = header.get_i16();
        if raw_slice < 0 {
            return Err(FrameError::InvalidSliceLength(raw_slice));
        }
        Ok(Self {
            total_length,
            sequence,
            slice_length: raw_slice as usize,
        })
    }
}

impl Frame {
    /// Split a serialized message into frames of at most `slice_cap` bytes.
    ///
    /// A message that fits produces a single frame (an empty message too);
    /// otherwise `n = ceil(len / cap)` frames of near-equal size.
    pub fn split(payload: Bytes, slice_cap: usize) -> Vec<Frame> {
        let cap = slice_cap.clamp(1, MAX_SLICE_SIZE);
        let total = payload.len();
        let total_length = total as i64;

        if total <= cap {
            return vec![Frame {
                total_length,
                sequence: 0,
                data: payload,
            }];
        }

        let count = total.div_ceil(cap);
        let base = total / count;
        let extra = total % count;

        let mut frames = Vec::with_capacity(count);
        let mut offset = 0;
        for i in 0..count {
            let len = base + usize::from(i < extra);
            frames.push(Frame {
                total_length,
                sequence: i as i32,
                data: payload.slice(offset..offset + len),
            });
            offset += len;
        }
        frames
    }

    /// Concatenate slices back into the original message.
    ///
    /// Frames may arrive in any order; gaps, duplicates and length
    /// disagreements are framing errors.
    pub fn reassemble(
        frames: impl IntoIterator<Item = Frame>,
    ) -> std::result::Result<Bytes, FrameError> {
        let mut frames: Vec<Frame> = frames.into_iter().collect();
        frames.sort_by_key(|f| f.sequence);

        let Some(first) = frames.first() else {
            return Err(FrameError::MissingSequence(0));
        };
        let total_length = first.total_length;
        if total_length < 0 {
            return Err(FrameError::NonPositiveLength(total_length));
        }

        let mut buf = BytesMut::with_capacity(total_length as usize);
        for (expected, frame) in frames.iter().enumerate() {
            let expected = expected as i32;
            if frame.sequence < expected {
                return Err(FrameError::DuplicateSequence(frame.sequence));
            }
            if frame.sequence > expected {
                return Err(FrameError::MissingSequence(expected));
            }
            if frame.total_length != total_length {
                return Err(FrameError::LengthMismatch {
                    expected: total_length,
                    actual: frame.total_length,
                });
            }
            buf.put_slice(&frame.data);
        }

        if buf.len() as i64 != total_length {
            return Err(FrameError::LengthMismatch {
                expected: total_length,
                actual: buf.len() as i64,
            });
        }
        Ok(buf.freeze())
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.data.len() + TRAILER_LEN
    }

    /// Header, slice and CRC32 trailer, unscrambled.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&FRAME_MAGIC);
        buf.put_i64(self.total_length);
        buf.put_i32(self.sequence);
        buf.put_i16(self.data.len() as i16);
        buf.put_slice(&self.data);
        let crc = checksum(&buf);
        buf.put_u32(crc);
        buf
    }

    /// Decode one complete, unscrambled frame and verify its trailer.
    pub fn decode(raw: &[u8]) -> std::result::Result<Frame, FrameError> {
        let header = FrameHeader::parse(raw)?;
        let body_end = HEADER_LEN + header.slice_length;
        if raw.len() != body_end + TRAILER_LEN {
            return Err(FrameError::Truncated {
                field: "frame body",
                need: body_end + TRAILER_LEN,
                have: raw.len(),
            });
        }
        verify_trailer(&raw[..body_end], &raw[body_end..])?;
        Ok(Frame {
            total_length: header.total_length,
            sequence: header.sequence,
            data: Bytes::copy_from_slice(&raw[HEADER_LEN..body_end]),
        })
    }
}

fn verify_trailer(covered: &[u8], mut trailer: &[u8]) -> std::result::Result<(), FrameError> {
    let expected = trailer.get_u32();
    let actual = checksum(covered);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Read one frame from the stream, unscrambling before the CRC check.
///
/// The declared message length is validated here so a corrupted header
/// cannot make the reader buffer unbounded data.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, scrambler: &Scrambler) -> Result<Frame> {
    let mut raw = vec![0u8; HEADER_LEN];
    r.read_exact(&mut raw).await?;
    scrambler.apply(&mut raw);
    let header = FrameHeader::parse(&raw)?;

    let mut rest = vec![0u8; header.slice_length + TRAILER_LEN];
    r.read_exact(&mut rest).await?;
    scrambler.apply(&mut rest);

    let (slice, trailer) = rest.split_at(header.slice_length);
    raw.extend_from_slice(slice);
    verify_trailer(&raw, trailer)?;

    if header.total_length <= 0 {
        return Err(FrameError::NonPositiveLength(header.total_length).into());
    }
    if header.total_length as u64 > MAX_MESSAGE_SIZE as u64 {
        return Err(FrameError::MessageTooLarge {
            len: header.total_length,
            max: MAX_MESSAGE_SIZE,
        }
        .into());
    }

    Ok(Frame {
        total_length: header.total_length,
        sequence: header.sequence,
        data: Bytes::from(raw).slice(HEADER_LEN..),
    })
}
