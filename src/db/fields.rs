//! Row data and request records exchanged between the façade and the
//! database server. All of them travel as MsgPack payloads.

use rusqlite::types::ValueRef;
use serde::{Deserialize, Serialize};

use crate::protocol::{decode_ascii, CastError};

/// Storage class of a value, or the affinity of a declared column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

impl FieldType {
    /// Column affinity of a declared type, following SQLite's rules.
    pub fn from_decl_type(decl: &str) -> Self {
        let decl = decl.to_ascii_uppercase();
        if decl.contains("INT") {
            FieldType::Integer
        } else if decl.contains("CHAR") || decl.contains("CLOB") || decl.contains("TEXT") {
            FieldType::Text
        } else if decl.is_empty() || decl.contains("BLOB") {
            FieldType::Blob
        } else {
            FieldType::Real
        }
    }

    /// SQLite type name.
    pub fn name(self) -> &'static str {
        match self {
            FieldType::Null => "NULL",
            FieldType::Integer => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Text => "TEXT",
            FieldType::Blob => "BLOB",
        }
    }
}

/// One value of a result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Null => FieldType::Null,
            FieldValue::Integer(_) => FieldType::Integer,
            FieldValue::Real(_) => FieldType::Real,
            FieldValue::Text(_) => FieldType::Text,
            FieldValue::Blob(_) => FieldType::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Value as `i64`; reals truncate, text must parse.
    pub fn as_i64(&self) -> Result<i64, CastError> {
        const TARGET: &str = "i64";
        match self {
            FieldValue::Null => Err(CastError::NoPayload { target: TARGET }),
            FieldValue::Integer(v) => Ok(*v),
            FieldValue::Real(v) => {
                if v.is_finite() && *v >= i64::MIN as f64 && *v <= i64::MAX as f64 {
                    Ok(*v as i64)
                } else {
                    Err(CastError::OutOfRange {
                        target: TARGET,
                        value: v.to_string(),
                    })
                }
            }
            FieldValue::Text(text) => text.trim().parse().map_err(|_| CastError::Unparseable {
                target: TARGET,
                text: text.clone(),
            }),
            FieldValue::Blob(bytes) => Err(CastError::Unparseable {
                target: TARGET,
                text: decode_ascii(bytes),
            }),
        }
    }

    /// Value as `i32`, failing when it does not fit.
    pub fn as_i32(&self) -> Result<i32, CastError> {
        let v = self.as_i64()?;
        i32::try_from(v).map_err(|_| CastError::OutOfRange {
            target: "i32",
            value: v.to_string(),
        })
    }

    /// Value as `i16`, failing when it does not fit.
    pub fn as_i16(&self) -> Result<i16, CastError> {
        let v = self.as_i64()?;
        i16::try_from(v).map_err(|_| CastError::OutOfRange {
            target: "i16",
            value: v.to_string(),
        })
    }

    pub fn as_f64(&self) -> Result<f64, CastError> {
        const TARGET: &str = "f64";
        match self {
            FieldValue::Null => Err(CastError::NoPayload { target: TARGET }),
            FieldValue::Integer(v) => Ok(*v as f64),
            FieldValue::Real(v) => Ok(*v),
            FieldValue::Text(text) => text.trim().parse().map_err(|_| CastError::Unparseable {
                target: TARGET,
                text: text.clone(),
            }),
            FieldValue::Blob(bytes) => Err(CastError::Unparseable {
                target: TARGET,
                text: decode_ascii(bytes),
            }),
        }
    }

    /// Value rendered as text; blobs are read as ASCII.
    pub fn as_string(&self) -> Result<String, CastError> {
        match self {
            FieldValue::Null => Err(CastError::NoPayload { target: "String" }),
            FieldValue::Integer(v) => Ok(v.to_string()),
            FieldValue::Real(v) => Ok(v.to_string()),
            FieldValue::Text(text) => Ok(text.clone()),
            FieldValue::Blob(bytes) => Ok(decode_ascii(bytes)),
        }
    }

    pub fn as_bytes(&self) -> Result<Vec<u8>, CastError> {
        match self {
            FieldValue::Null => Err(CastError::NoPayload { target: "Vec<u8>" }),
            FieldValue::Blob(bytes) => Ok(bytes.clone()),
            FieldValue::Text(text) => Ok(text.clone().into_bytes()),
            other => Ok(other.as_string()?.into_bytes()),
        }
    }
}

impl From<ValueRef<'_>> for FieldValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => FieldValue::Null,
            ValueRef::Integer(v) => FieldValue::Integer(v),
            ValueRef::Real(v) => FieldValue::Real(v),
            ValueRef::Text(bytes) => FieldValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => FieldValue::Blob(bytes.to_vec()),
        }
    }
}

/// Column metadata of a result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type, absent for expressions.
    pub decl_type: Option<String>,
    /// Source table. The engine binding does not expose column origin
    /// metadata, so this is currently always `None`.
    pub table_name: Option<String>,
}

impl ColumnInfo {
    /// Declared type name, or the storage class of `sample` for
    /// expression columns.
    pub fn data_type_name(&self, sample: Option<&FieldValue>) -> String {
        match &self.decl_type {
            Some(decl) => decl.clone(),
            None => sample
                .map(FieldValue::field_type)
                .unwrap_or(FieldType::Blob)
                .name()
                .to_string(),
        }
    }
}

/// One materialized result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<FieldValue>>,
}

/// `CreateCommandRequest` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCommand {
    pub text: String,
}

/// Payload of `ExecuteNonQueryRequest` and `ExecuteReaderRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub command_id: String,
    /// 0 means no limit.
    pub timeout_ms: u64,
}

/// `ExecuteReaderResponse` payload: shape of the current result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderMeta {
    pub columns: Vec<ColumnInfo>,
}

/// `ExecuteReaderGetDataTypeNameRequest` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTypeNameRequest {
    pub command_id: String,
    pub ordinal: u32,
}

/// `ExecuteReaderGetRowResponse` payload.
pub type Row = Vec<FieldValue>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;

    #[test]
    fn test_affinity_rules() {
        assert_eq!(FieldType::from_decl_type("integer"), FieldType::Integer);
        assert_eq!(FieldType::from_decl_type("BIGINT"), FieldType::Integer);
        assert_eq!(FieldType::from_decl_type("varchar(20)"), FieldType::Text);
        assert_eq!(FieldType::from_decl_type("DOUBLE"), FieldType::Real);
        assert_eq!(FieldType::from_decl_type(""), FieldType::Blob);
        assert_eq!(FieldType::Integer.name(), "INTEGER");
    }

    #[test]
    fn test_integer_conversions() {
        let v = FieldValue::Integer(70_000);
        assert_eq!(v.as_i64().unwrap(), 70_000);
        assert_eq!(v.as_i32().unwrap(), 70_000);
        assert!(matches!(v.as_i16(), Err(CastError::OutOfRange { .. })));
        assert_eq!(v.as_string().unwrap(), "70000");
        assert_eq!(v.as_f64().unwrap(), 70_000.0);
    }

    #[test]
    fn test_text_conversions() {
        assert_eq!(FieldValue::Text(" 12 ".into()).as_i32().unwrap(), 12);
        assert!(matches!(
            FieldValue::Text("abc".into()).as_i64(),
            Err(CastError::Unparseable { .. })
        ));
        assert_eq!(FieldValue::Text("a".into()).as_bytes().unwrap(), b"a");
    }

    #[test]
    fn test_null_is_no_payload() {
        assert!(FieldValue::Null.is_null());
        assert!(matches!(FieldValue::Null.as_string(), Err(CastError::NoPayload { .. })));
        assert!(matches!(FieldValue::Null.as_i64(), Err(CastError::NoPayload { .. })));
    }

    #[test]
    fn test_row_survives_msgpack() {
        let row: Row = vec![
            FieldValue::Text("a".into()),
            FieldValue::Integer(10),
            FieldValue::Null,
            FieldValue::Real(1.5),
            FieldValue::Blob(vec![0, 255]),
        ];
        let bytes = MsgPackCodec::encode(&row).unwrap();
        let decoded: Row = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_data_type_name_falls_back_to_value() {
        let declared = ColumnInfo {
            name: "value".into(),
            decl_type: Some("integer".into()),
            table_name: None,
        };
        assert_eq!(declared.data_type_name(None), "integer");

        let expression = ColumnInfo {
            name: "count(*)".into(),
            decl_type: None,
            table_name: None,
        };
        assert_eq!(expression.data_type_name(Some(&FieldValue::Integer(3))), "INTEGER");
    }
}
