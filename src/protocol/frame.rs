//! Wire frame: one `{length, kind, payload}` unit.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing. A zero-length payload
//! is always represented as an absent payload, never as an empty buffer.
//!
//! # Example
//!
//! ```
//! use sqlite_share::protocol::{MessageKind, WireFrame};
//!
//! let frame = WireFrame::from_scalar(MessageKind::ExecuteRequestResponse, 42i32);
//! let bytes = frame.encode();
//! assert_eq!(bytes.len(), 8 + 4);
//!
//! let decoded = WireFrame::decode(&bytes).unwrap();
//! assert_eq!(decoded.get::<i64>().unwrap(), 42);
//! ```

use std::sync::OnceLock;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::scalar::{decode_ascii, CastError, FromPayload, Scalar};
use super::wire_format::{FrameError, Header, HEADER_SIZE};
use super::MessageKind;
use crate::codec::MsgPackCodec;
use crate::error::Result;

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct WireFrame {
    kind: MessageKind,
    /// Kind as it appears on the wire; differs from `kind` only for unknown values.
    raw_kind: u32,
    payload: Option<Bytes>,
    /// Encoding computed on first use.
    encoded: OnceLock<Bytes>,
}

impl WireFrame {
    /// Create a frame; an empty payload is stored as absent.
    pub fn new(kind: MessageKind, payload: Option<Bytes>) -> Self {
        Self {
            kind,
            raw_kind: kind.to_u32(),
            payload: payload.filter(|p| !p.is_empty()),
            encoded: OnceLock::new(),
        }
    }

    /// Create a frame without payload.
    pub fn empty(kind: MessageKind) -> Self {
        Self::new(kind, None)
    }

    /// Create a frame from raw payload bytes.
    pub fn with_payload(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self::new(kind, Some(payload.into()))
    }

    /// Create a frame carrying a fixed-width scalar or ASCII text.
    pub fn from_scalar(kind: MessageKind, value: impl Into<Scalar>) -> Self {
        Self::new(kind, value.into().encode())
    }

    /// Create a frame carrying a MsgPack-encoded record.
    pub fn from_record<T: Serialize>(kind: MessageKind, record: &T) -> Result<Self> {
        Ok(Self::with_payload(kind, MsgPackCodec::encode(record)?))
    }

    /// Get the message kind.
    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Message kind exactly as read from or written to the wire.
    #[inline]
    pub fn raw_kind(&self) -> u32 {
        self.raw_kind
    }

    /// Get a reference to the payload, if any.
    #[inline]
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Get a clone of the payload as Bytes (cheap, zero-copy).
    #[inline]
    pub fn payload_bytes(&self) -> Option<Bytes> {
        self.payload.clone()
    }

    /// Payload length; 0 when absent.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }

    /// Whether the frame has no payload.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
    }

    /// Total encoded size (header + payload).
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.len()
    }

    /// Encode to wire bytes. The result is computed once and cached.
    pub fn encode(&self) -> Bytes {
        self.encoded
            .get_or_init(|| {
                let length = i32::try_from(self.len()).unwrap_or(i32::MAX);
                let mut buf = BytesMut::with_capacity(self.encoded_len());
                let header = Header {
                    length,
                    kind: self.raw_kind,
                };
                buf.put_slice(&header.encode());
                if let Some(payload) = &self.payload {
                    buf.put_slice(payload);
                }
                buf.freeze()
            })
            .clone()
    }

    /// Decode exactly one frame from `bytes`.
    ///
    /// # Errors
    ///
    /// - [`FrameError::TooShort`] if fewer than 8 bytes are given.
    /// - [`FrameError::SizeMismatch`] if the declared length + 8 is not the total length.
    /// - [`FrameError::NegativeLength`] if the declared length is negative.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, FrameError> {
        let header = Header::decode(bytes).ok_or(FrameError::TooShort { len: bytes.len() })?;
        let declared = usize::try_from(header.length)
            .map_err(|_| FrameError::NegativeLength(header.length))?;
        let actual = bytes.len() - HEADER_SIZE;
        if declared != actual {
            return Err(FrameError::SizeMismatch { declared, actual });
        }
        let payload = (declared > 0).then(|| Bytes::copy_from_slice(&bytes[HEADER_SIZE..]));
        Ok(Self::from_parts(header, payload))
    }

    /// Build a frame from an already validated header and payload.
    pub(crate) fn from_parts(header: Header, payload: Option<Bytes>) -> Self {
        let kind = header.message_kind();
        if kind == MessageKind::Unknown && header.kind != 0 {
            tracing::debug!("Decoded frame with unknown message kind {}", header.kind);
        }
        Self {
            raw_kind: header.kind,
            ..Self::new(kind, payload)
        }
    }

    /// Read the payload as `T`, failing on impossible conversions.
    pub fn get<T: FromPayload>(&self) -> std::result::Result<T, CastError> {
        T::from_payload(self.payload())
    }

    /// Read the payload as `T`; when `strict` is false a failed conversion
    /// yields `T::default()` instead of an error.
    pub fn get_with<T: FromPayload>(&self, strict: bool) -> std::result::Result<T, CastError> {
        match self.get::<T>() {
            Ok(value) => Ok(value),
            Err(_) if !strict => Ok(T::default()),
            Err(e) => Err(e),
        }
    }

    /// Payload as nullable text.
    pub fn text(&self) -> Option<String> {
        self.payload().map(decode_ascii)
    }

    /// Decode a MsgPack-encoded record from the payload.
    pub fn record<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self.payload().ok_or(CastError::NoPayload {
            target: std::any::type_name::<T>(),
        })?;
        MsgPackCodec::decode(payload)
    }
}

impl PartialEq for WireFrame {
    fn eq(&self, other: &Self) -> bool {
        self.raw_kind == other.raw_kind && self.payload == other.payload
    }
}

impl Eq for WireFrame {}
