//! MsgPack codec using `rmp-serde`.
//!
//! Structs are written with `to_vec_named` (struct-as-map), so adding an
//! optional field to a record does not break peers built before it.

use crate::error::Result;

/// MessagePack codec for structured payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct CommandRecord {
        text: String,
        timeout_ms: u64,
        prepared: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = CommandRecord {
            text: "insert into t values (1)".to_string(),
            timeout_ms: 30_000,
            prepared: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: CommandRecord = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_structs_are_maps() {
        let record = CommandRecord {
            text: String::new(),
            timeout_ms: 0,
            prepared: false,
        };

        let encoded = MsgPackCodec::encode(&record).unwrap();

        // 0x83 = fixmap with 3 entries; an array would be 0x93
        assert_eq!(encoded[0], 0x83);
    }

    #[test]
    fn test_optional_fields_tolerate_older_peers() {
        #[derive(Serialize)]
        struct Old {
            text: String,
        }

        #[derive(Deserialize, Debug)]
        struct New {
            text: String,
            #[serde(default)]
            timeout_ms: Option<u64>,
        }

        let encoded = MsgPackCodec::encode(&Old {
            text: "select 1".into(),
        })
        .unwrap();
        let decoded: New = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded.text, "select 1");
        assert_eq!(decoded.timeout_ms, None);
    }

    #[test]
    fn test_nested_rows() {
        let rows: Vec<Vec<Option<i64>>> = vec![vec![Some(1), None], vec![Some(3), Some(4)]];
        let encoded = MsgPackCodec::encode(&rows).unwrap();
        let decoded: Vec<Vec<Option<i64>>> = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let invalid = b"not valid msgpack";
        let result: Result<CommandRecord> = MsgPackCodec::decode(invalid);
        assert!(result.is_err());
    }
}
