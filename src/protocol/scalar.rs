//! Scalar payloads and the payload conversion matrix.
//!
//! Scalars travel as fixed-width little-endian values (`i16` = 2 bytes,
//! `i32` = 4, `i64`/`f64` = 8) or as ASCII text. Readers do not know which
//! scalar the sender used, so reading is driven by the payload width:
//!
//! | payload      | `i16`      | `i32`      | `i64`   | `f64`       | `bool`   | `String` |
//! |--------------|------------|------------|---------|-------------|----------|----------|
//! | absent       | NoPayload  | NoPayload  | NoPayload | NoPayload | NoPayload | NoPayload |
//! | 2 bytes      | as `i16`   | `i16` widened | `i16` widened | `i16` widened | `!= 0` | text |
//! | 4 bytes      | `i32` narrowed | as `i32` | `i32` widened | `i32` widened | `!= 0` | text |
//! | 8 bytes      | `i64` narrowed | `i64` narrowed | as `i64` | as `f64` | `!= 0` | text |
//! | other widths | parse text | parse text | parse text | parse text | parse text | text |
//!
//! Narrowing that does not fit is `OutOfRange`. Text that does not parse is
//! `Unparseable`. A non-strict read turns any of these into the type default.

use bytes::Bytes;
use thiserror::Error;

/// Errors from reading a payload as a typed value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CastError {
    /// The frame carries no payload.
    #[error("no payload to read as {target}")]
    NoPayload {
        /// Requested type.
        target: &'static str,
    },

    /// Text payload does not parse as the requested type.
    #[error("cannot parse {text:?} as {target}")]
    Unparseable {
        /// Requested type.
        target: &'static str,
        /// Payload decoded as text.
        text: String,
    },

    /// Value does not fit the requested type.
    #[error("value {value} out of range for {target}")]
    OutOfRange {
        /// Requested type.
        target: &'static str,
        /// Value that did not fit.
        value: String,
    },
}

/// A typed scalar that can be carried as a frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// 2-byte integer.
    I16(i16),
    /// 4-byte integer.
    I32(i32),
    /// 8-byte integer.
    I64(i64),
    /// 8-byte float.
    F64(f64),
    /// ASCII text; `None` is carried as an absent payload.
    Str(Option<String>),
    /// Raw bytes.
    Bytes(Bytes),
}

impl Scalar {
    /// Encode to payload bytes; `None` means "no payload".
    pub fn encode(&self) -> Option<Bytes> {
        let bytes = match self {
            Scalar::I16(v) => Bytes::copy_from_slice(&v.to_le_bytes()),
            Scalar::I32(v) => Bytes::copy_from_slice(&v.to_le_bytes()),
            Scalar::I64(v) => Bytes::copy_from_slice(&v.to_le_bytes()),
            Scalar::F64(v) => Bytes::copy_from_slice(&v.to_le_bytes()),
            Scalar::Str(None) => return None,
            Scalar::Str(Some(text)) => encode_ascii(text),
            Scalar::Bytes(bytes) => bytes.clone(),
        };
        if bytes.is_empty() {
            None
        } else {
            Some(bytes)
        }
    }
}

impl From<i16> for Scalar {
    fn from(value: i16) -> Self {
        Scalar::I16(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::I32(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::I64(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::F64(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::I32(i32::from(value))
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Str(Some(value.to_string()))
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Str(Some(value))
    }
}

impl From<Option<&str>> for Scalar {
    fn from(value: Option<&str>) -> Self {
        Scalar::Str(value.map(str::to_string))
    }
}

/// Encode text as ASCII; characters outside ASCII become `?`.
pub fn encode_ascii(text: &str) -> Bytes {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect::<Vec<u8>>()
        .into()
}

/// Decode ASCII bytes; bytes outside ASCII become `?`.
pub fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

/// Types that can be read from a frame payload.
pub trait FromPayload: Sized + Default {
    /// Name used in cast errors.
    const TYPE_NAME: &'static str;

    /// Convert payload bytes following the width-driven matrix.
    fn from_payload(payload: Option<&[u8]>) -> Result<Self, CastError>;
}

fn require<'a>(payload: Option<&'a [u8]>, target: &'static str) -> Result<&'a [u8], CastError> {
    payload.ok_or(CastError::NoPayload { target })
}

fn read_i16(bytes: &[u8]) -> i16 {
    i16::from_le_bytes([bytes[0], bytes[1]])
}

fn read_i32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_8(bytes: &[u8]) -> [u8; 8] {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    raw
}

fn parse_text<T: std::str::FromStr>(bytes: &[u8], target: &'static str) -> Result<T, CastError> {
    let text = decode_ascii(bytes);
    text.trim()
        .parse::<T>()
        .map_err(|_| CastError::Unparseable { target, text })
}

/// Read an integer of any carried width as `i64`, or `None` for other widths.
fn read_integer(bytes: &[u8]) -> Option<i64> {
    match bytes.len() {
        2 => Some(i64::from(read_i16(bytes))),
        4 => Some(i64::from(read_i32(bytes))),
        8 => Some(i64::from_le_bytes(read_8(bytes))),
        _ => None,
    }
}

fn narrow<T: TryFrom<i64>>(value: i64, target: &'static str) -> Result<T, CastError> {
    T::try_from(value).map_err(|_| CastError::OutOfRange {
        target,
        value: value.to_string(),
    })
}

macro_rules! integer_from_payload {
    ($ty:ty, $name:expr) => {
        impl FromPayload for $ty {
            const TYPE_NAME: &'static str = $name;

            fn from_payload(payload: Option<&[u8]>) -> Result<Self, CastError> {
                let bytes = require(payload, Self::TYPE_NAME)?;
                match read_integer(bytes) {
                    Some(value) => narrow(value, Self::TYPE_NAME),
                    None => parse_text(bytes, Self::TYPE_NAME),
                }
            }
        }
    };
}

integer_from_payload!(i16, "i16");
integer_from_payload!(i32, "i32");
integer_from_payload!(i64, "i64");

impl FromPayload for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn from_payload(payload: Option<&[u8]>) -> Result<Self, CastError> {
        let bytes = require(payload, Self::TYPE_NAME)?;
        match bytes.len() {
            2 => Ok(f64::from(read_i16(bytes))),
            4 => Ok(f64::from(read_i32(bytes))),
            8 => Ok(f64::from_le_bytes(read_8(bytes))),
            _ => parse_text(bytes, Self::TYPE_NAME),
        }
    }
}

impl FromPayload for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_payload(payload: Option<&[u8]>) -> Result<Self, CastError> {
        let bytes = require(payload, Self::TYPE_NAME)?;
        if let Some(value) = read_integer(bytes) {
            return Ok(value != 0);
        }
        let text = decode_ascii(bytes);
        match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(CastError::Unparseable {
                target: Self::TYPE_NAME,
                text,
            }),
        }
    }
}

impl FromPayload for String {
    const TYPE_NAME: &'static str = "string";

    fn from_payload(payload: Option<&[u8]>) -> Result<Self, CastError> {
        require(payload, Self::TYPE_NAME).map(decode_ascii)
    }
}

impl FromPayload for Vec<u8> {
    const TYPE_NAME: &'static str = "bytes";

    fn from_payload(payload: Option<&[u8]>) -> Result<Self, CastError> {
        require(payload, Self::TYPE_NAME).map(<[u8]>::to_vec)
    }
}
