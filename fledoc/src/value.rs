//! Canonical byte encoding of field values before encryption.
//!
//! Every plaintext starts with a one-byte type tag so decryption restores the
//! original JSON type. Deterministic encryption only accepts scalar types
//! whose encoding is canonical; anything else would break equality matching.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use zeroize::Zeroizing;

use crate::envelope::{is_encrypted_value, Algorithm};
use crate::error::{Error, Result};

const TAG_DOUBLE: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_OBJECT: u8 = 0x03;
const TAG_ARRAY: u8 = 0x04;
const TAG_BOOL: u8 = 0x08;
const TAG_UINT64: u8 = 0x11;
const TAG_INT64: u8 = 0x12;

/// Declared type of an encrypted field, as in a `bsonType` schema keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// UTF-8 string
    String,
    /// Integer that fits in 32 bits
    Int,
    /// Integer that fits in 64 bits
    Long,
    /// Floating point number
    Double,
    /// Boolean
    Bool,
    /// Nested document
    Object,
    /// Array
    Array,
}

impl ValueType {
    /// Parses a `bsonType` keyword.
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "string" => Some(Self::String),
            "int" => Some(Self::Int),
            "long" => Some(Self::Long),
            "double" => Some(Self::Double),
            "bool" => Some(Self::Bool),
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            _ => None,
        }
    }

    /// Whether `value` is of this type.
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match (self, value) {
            (Self::String, Value::String(_))
            | (Self::Bool, Value::Bool(_))
            | (Self::Object, Value::Object(_))
            | (Self::Array, Value::Array(_)) => true,
            (Self::Int, Value::Number(n)) => {
                n.as_i64().is_some_and(|v| i32::try_from(v).is_ok())
            }
            (Self::Long, Value::Number(n)) => n.as_i64().is_some(),
            (Self::Double, Value::Number(n)) => n.is_f64(),
            _ => false,
        }
    }
}

/// Encodes `value` for encryption under `algorithm`.
///
/// # Errors
///
/// Returns `Error::FieldType` if the value is `null`, is already an
/// encrypted envelope, or is not a canonical scalar (string, integer,
/// boolean) while `algorithm` is deterministic.
pub fn encode(field: &str, value: &Value, algorithm: Algorithm) -> Result<Zeroizing<Vec<u8>>> {
    let deterministic = algorithm == Algorithm::Deterministic;
    let reject = |reason: &str| Error::FieldType {
        field: field.to_string(),
        reason: reason.to_string(),
    };

    if is_encrypted_value(value) {
        return Err(reject("value is already encrypted"));
    }

    let mut out = Zeroizing::new(Vec::new());
    match value {
        Value::Null => return Err(reject("null values cannot be encrypted")),
        Value::String(s) => {
            out.push(TAG_STRING);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Number(n) => encode_number(n, deterministic, &mut out).map_err(|r| reject(r))?,
        Value::Object(_) | Value::Array(_) if deterministic => {
            return Err(reject("documents and arrays cannot use deterministic encryption"));
        }
        Value::Object(_) | Value::Array(_) => {
            out.push(if value.is_object() { TAG_OBJECT } else { TAG_ARRAY });
            let json = Zeroizing::new(
                serde_json::to_vec(value).map_err(|e| reject(&format!("not serializable: {e}")))?,
            );
            out.extend_from_slice(&json);
        }
    }
    Ok(out)
}

fn encode_number(
    n: &Number,
    deterministic: bool,
    out: &mut Vec<u8>,
) -> std::result::Result<(), &'static str> {
    if let Some(v) = n.as_i64() {
        out.push(TAG_INT64);
        out.extend_from_slice(&v.to_be_bytes());
    } else if let Some(v) = n.as_u64() {
        out.push(TAG_UINT64);
        out.extend_from_slice(&v.to_be_bytes());
    } else if deterministic {
        return Err("floating point values cannot use deterministic encryption");
    } else {
        let v = n.as_f64().ok_or("number is not representable")?;
        out.push(TAG_DOUBLE);
        out.extend_from_slice(&v.to_be_bytes());
    }
    Ok(())
}

/// Decodes bytes produced by [`encode`] back into a value.
///
/// # Errors
///
/// Returns `Error::InvalidEnvelope` if the type tag is unknown or the
/// payload does not match it.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let (&tag, payload) =
        bytes.split_first().ok_or_else(|| Error::InvalidEnvelope("empty plaintext".into()))?;
    let malformed = |what: &str| Error::InvalidEnvelope(format!("malformed {what} plaintext"));

    let value = match tag {
        TAG_STRING => Value::String(
            String::from_utf8(payload.to_vec()).map_err(|_| malformed("string"))?,
        ),
        TAG_BOOL => match payload {
            [0] => Value::Bool(false),
            [1] => Value::Bool(true),
            _ => return Err(malformed("bool")),
        },
        TAG_INT64 => {
            let raw: [u8; 8] = payload.try_into().map_err(|_| malformed("int64"))?;
            Value::from(i64::from_be_bytes(raw))
        }
        TAG_UINT64 => {
            let raw: [u8; 8] = payload.try_into().map_err(|_| malformed("uint64"))?;
            Value::from(u64::from_be_bytes(raw))
        }
        TAG_DOUBLE => {
            let raw: [u8; 8] = payload.try_into().map_err(|_| malformed("double"))?;
            Number::from_f64(f64::from_be_bytes(raw))
                .map(Value::Number)
                .ok_or_else(|| malformed("double"))?
        }
        TAG_OBJECT | TAG_ARRAY => {
            let value: Value = serde_json::from_slice(payload).map_err(|_| malformed("document"))?;
            let expected_object = tag == TAG_OBJECT;
            if value.is_object() != expected_object || (!expected_object && !value.is_array()) {
                return Err(malformed("document"));
            }
            value
        }
        other => {
            return Err(Error::InvalidEnvelope(format!("unknown plaintext type tag {other:#04x}")))
        }
    };
    Ok(value)
}
