//! Wire format encoding and decoding.
//!
//! Every frame starts with an 8-byte header:
//! ```text
//! ┌──────────┬──────────────┬─────────────────┐
//! │ Length   │ Message kind │ Payload         │
//! │ 4 bytes  │ 4 bytes      │ `Length` bytes  │
//! │ int32 LE │ uint32 LE    │                 │
//! └──────────┴──────────────┴─────────────────┘
//! ```
//!
//! All multi-byte integers are Little Endian.

use thiserror::Error;

use super::MessageKind;

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Default maximum payload size (256 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 256 * 1024 * 1024;

/// Absolute maximum payload size (max i32).
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: u32 = i32::MAX as u32;

/// Errors from decoding frame bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than a header.
    #[error("frame too short: {len} bytes, need at least {HEADER_SIZE}")]
    TooShort {
        /// Bytes supplied.
        len: usize,
    },

    /// Declared payload length does not match the bytes supplied.
    #[error("frame size mismatch: header declares {declared} payload bytes, {actual} supplied")]
    SizeMismatch {
        /// Payload length from the header.
        declared: usize,
        /// Payload bytes actually present.
        actual: usize,
    },

    /// Declared length is negative.
    #[error("negative frame length {0}")]
    NegativeLength(i32),

    /// Declared length exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Declared payload length.
        size: u32,
        /// Configured maximum.
        max: u32,
    },
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Declared payload length (signed on the wire).
    pub length: i32,
    /// Raw message kind.
    pub kind: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(kind: MessageKind, length: i32) -> Self {
        Self {
            length,
            kind: kind.to_u32(),
        }
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use sqlite_share::protocol::{Header, MessageKind};
    ///
    /// let header = Header::new(MessageKind::SendAndWaitRequest, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes, [100, 0, 0, 0, 1, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (8 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.kind.to_le_bytes());
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            kind: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Payload length as `usize`, rejecting negative and oversized values.
    pub fn payload_len(&self, max_payload_size: u32) -> Result<usize, FrameError> {
        let size = u32::try_from(self.length).map_err(|_| FrameError::NegativeLength(self.length))?;
        if size > max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: max_payload_size,
            });
        }
        Ok(size as usize)
    }

    /// Message kind, mapping values unknown to this build to `Unknown`.
    #[inline]
    pub fn message_kind(&self) -> MessageKind {
        MessageKind::from_u32_lossy(self.kind)
    }
}
