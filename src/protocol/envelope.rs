//! Correlated envelope for send-and-wait exchanges.
//!
//! Wire layout (the payload of a `SendAndWaitRequest`/`SendAndWaitResponse` frame):
//! ```text
//! ┌──────────────────┬──────────────┬───────────┬────────────────┐
//! │ payload.len()+36 │ Message kind │ Payload   │ Correlation id │
//! │ int32 LE         │ uint32 LE    │ N bytes   │ 36 ASCII bytes │
//! └──────────────────┴──────────────┴───────────┴────────────────┘
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use super::wire_format::{Header, HEADER_SIZE};
use super::{MessageKind, WireFrame};

/// Length of a textual correlation id (hyphenated GUID).
pub const CORRELATION_ID_LEN: usize = 36;

/// Errors from building or parsing a correlated envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// No correlation id supplied.
    #[error("correlation id is missing")]
    MissingCorrelationId,

    /// Correlation id has the wrong length.
    #[error("correlation id must be {CORRELATION_ID_LEN} characters, got {len}")]
    InvalidCorrelationId {
        /// Length of the rejected id.
        len: usize,
    },

    /// Buffer ends before the envelope does.
    #[error("envelope truncated: need {needed} bytes, got {actual}")]
    Truncated {
        /// Bytes required at the failing stage.
        needed: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Declared length is impossible or disagrees with the buffer.
    #[error("envelope length mismatch: declared {declared}, buffer holds {actual}")]
    LengthMismatch {
        /// Declared combined length.
        declared: i64,
        /// Combined bytes present after the header.
        actual: usize,
    },
}

/// A validated 36-character correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random id (UUID v4, hyphenated).
    pub fn new() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Validate an id supplied by the caller.
    pub fn parse(id: Option<&str>) -> Result<Self, EnvelopeError> {
        let id = id.ok_or(EnvelopeError::MissingCorrelationId)?;
        let len = id.chars().count();
        if len != CORRELATION_ID_LEN || !id.is_ascii() {
            return Err(EnvelopeError::InvalidCorrelationId { len });
        }
        Ok(Self(id.to_string()))
    }

    /// The id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message kind and payload tagged with a correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatedEnvelope {
    kind: MessageKind,
    payload: Bytes,
    correlation_id: CorrelationId,
}

impl CorrelatedEnvelope {
    /// Wrap a payload with a freshly generated correlation id.
    pub fn new(kind: MessageKind, payload: Option<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.unwrap_or_default(),
            correlation_id: CorrelationId::new(),
        }
    }

    /// Wrap a payload with an explicit correlation id.
    ///
    /// # Errors
    ///
    /// Fails if the id is missing or not exactly 36 characters.
    pub fn with_id(
        kind: MessageKind,
        payload: Option<Bytes>,
        correlation_id: Option<&str>,
    ) -> Result<Self, EnvelopeError> {
        Ok(Self::with_correlation(
            kind,
            payload,
            CorrelationId::parse(correlation_id)?,
        ))
    }

    /// Wrap a payload with an already validated id.
    pub fn with_correlation(
        kind: MessageKind,
        payload: Option<Bytes>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            kind,
            payload: payload.unwrap_or_default(),
            correlation_id,
        }
    }

    /// Wrap a frame's kind and payload with a fresh id.
    pub fn for_frame(frame: &WireFrame) -> Self {
        Self::new(frame.kind(), frame.payload_bytes())
    }

    /// Inner message kind.
    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Inner payload (empty when the inner frame had none).
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Correlation id.
    #[inline]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Encode to the envelope wire layout.
    pub fn pack(&self) -> Bytes {
        let combined = self.payload.len() + CORRELATION_ID_LEN;
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + combined);
        let length = i32::try_from(combined).unwrap_or(i32::MAX);
        buf.put_slice(&Header::new(self.kind, length).encode());
        buf.put_slice(&self.payload);
        buf.put_slice(self.correlation_id.as_str().as_bytes());
        buf.freeze()
    }

    /// Parse the envelope wire layout.
    pub fn unpack(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let header = Header::decode(bytes).ok_or(EnvelopeError::Truncated {
            needed: HEADER_SIZE,
            actual: bytes.len(),
        })?;
        let actual = bytes.len() - HEADER_SIZE;
        let combined = usize::try_from(header.length)
            .ok()
            .filter(|len| *len >= CORRELATION_ID_LEN)
            .ok_or(EnvelopeError::LengthMismatch {
                declared: i64::from(header.length),
                actual,
            })?;
        if actual < combined {
            return Err(EnvelopeError::Truncated {
                needed: HEADER_SIZE + combined,
                actual: bytes.len(),
            });
        }
        if actual > combined {
            return Err(EnvelopeError::LengthMismatch {
                declared: i64::from(header.length),
                actual,
            });
        }

        let payload_end = HEADER_SIZE + combined - CORRELATION_ID_LEN;
        let id_bytes = &bytes[payload_end..];
        let id = std::str::from_utf8(id_bytes)
            .map_err(|_| EnvelopeError::InvalidCorrelationId { len: id_bytes.len() })?;

        Ok(Self {
            kind: header.message_kind(),
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..payload_end]),
            correlation_id: CorrelationId::parse(Some(id))?,
        })
    }

    /// Parse the envelope carried by an outer frame.
    pub fn from_frame(frame: &WireFrame) -> Result<Self, EnvelopeError> {
        Self::unpack(frame.payload().unwrap_or_default())
    }

    /// Inner kind and payload as a standalone frame; the id is dropped.
    pub fn to_frame(&self) -> WireFrame {
        WireFrame::new(self.kind, Some(self.payload.clone()))
    }

    /// Packed envelope as the payload of an outer frame.
    pub fn into_frame(self, outer: MessageKind) -> WireFrame {
        WireFrame::with_payload(outer, self.pack())
    }
}
