//! Codec module - serialization of structured frame payloads.
//!
//! Scalars travel as fixed-width values (see [`crate::protocol::Scalar`]).
//! Anything structured (command requests, reader metadata, rows) is encoded
//! with [`MsgPackCodec`] from serde-derived record types.
//!
//! # Example
//!
//! ```
//! use sqlite_share::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&("select 1", 30_000u64)).unwrap();
//! let decoded: (String, u64) = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded.0, "select 1");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
