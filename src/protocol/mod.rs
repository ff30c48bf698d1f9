//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary protocol spoken between the server
//! process and its clients:
//! - 8-byte header encoding/decoding
//! - Frame assembler for accumulating partial reads
//! - Wire frame with typed payload accessors
//! - Correlated envelope for send-and-wait exchanges

mod envelope;
mod frame;
mod frame_buffer;
mod message_kind;
mod scalar;
mod wire_format;

pub use envelope::{CorrelatedEnvelope, CorrelationId, EnvelopeError, CORRELATION_ID_LEN};
pub use frame::WireFrame;
pub use frame_buffer::FrameAssembler;
pub use message_kind::MessageKind;
pub use scalar::{decode_ascii, encode_ascii, CastError, FromPayload, Scalar};
pub use wire_format::{
    FrameError, Header, ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
};
