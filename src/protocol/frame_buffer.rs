//! Frame assembler for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management. A socket may deliver
//! partial frames, several frames at once, or one byte at a time; the
//! assembler absorbs all of these and hands out complete frames in arrival
//! order.
//!
//! # Example
//!
//! ```
//! use sqlite_share::protocol::{FrameAssembler, MessageKind, WireFrame};
//!
//! let bytes = WireFrame::from_scalar(MessageKind::ExecuteRequestResponse, 1i32).encode();
//!
//! let mut assembler = FrameAssembler::new();
//! assembler.queue(&bytes[..3]).unwrap();
//! assert!(assembler.drain().is_empty());
//!
//! assembler.queue(&bytes[3..]).unwrap();
//! assert_eq!(assembler.drain().len(), 1);
//! ```

use bytes::BytesMut;

use super::wire_format::{FrameError, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::WireFrame;

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// `current_buffer` holds the bytes of an incomplete trailing frame;
/// `ready` only ever holds complete frames.
#[derive(Debug)]
pub struct FrameAssembler {
    /// Accumulated bytes not yet consumed as a frame.
    buffer: BytesMut,
    /// Complete frames waiting for `drain`.
    ready: Vec<WireFrame>,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameAssembler {
    /// Create a new assembler with default settings.
    ///
    /// Default capacity: 64KB, max payload: 256MB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new assembler with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            ready: Vec::new(),
            max_payload_size,
        }
    }

    /// Append data and extract every frame that is now complete.
    ///
    /// # Errors
    ///
    /// Returns an error if a header declares a negative or oversized length.
    /// The stream cannot be resynchronised after that, so the buffered bytes
    /// are discarded.
    pub fn queue(&mut self, data: &[u8]) -> Result<(), FrameError> {
        self.buffer.extend_from_slice(data);

        while self.buffer.len() >= HEADER_SIZE {
            // Header is peeked, consumed only once the whole frame is present
            let Some(header) = Header::decode(&self.buffer[..HEADER_SIZE]) else {
                break;
            };

            let payload_len = match header.payload_len(self.max_payload_size) {
                Ok(len) => len,
                Err(e) => {
                    self.buffer.clear();
                    return Err(e);
                }
            };

            if self.buffer.len() < HEADER_SIZE + payload_len {
                break;
            }

            let _ = self.buffer.split_to(HEADER_SIZE);
            let payload = (payload_len > 0).then(|| self.buffer.split_to(payload_len).freeze());
            self.ready.push(WireFrame::from_parts(header, payload));
        }

        Ok(())
    }

    /// Take all frames extracted so far. Returns an empty vector when none are ready.
    pub fn drain(&mut self) -> Vec<WireFrame> {
        std::mem::take(&mut self.ready)
    }

    /// Get the number of buffered (not yet framed) bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of complete frames waiting for `drain`.
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Clear buffered bytes and ready frames.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.ready.clear();
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
