//! Host-side value trees

use std::fmt;

use serde::Serialize;

use crate::error::ConversionError;

/// Plain-data snapshot of a script value.
///
/// Objects keep insertion order. Functions are not representable and are
/// skipped when snapshotting objects. BigInts keep full precision within
/// `i128`; `ArrayBuffer` and `Uint8Array` contents become [`HostValue::Bytes`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<HostValue>),
    Object(Vec<(String, HostValue)>),
}

impl HostValue {
    /// Serialize any record into a value tree
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, ConversionError> {
        serde_json::to_value(value)
            .map(HostValue::from)
            .map_err(|err| ConversionError::new(err.to_string()))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, HostValue::Undefined | HostValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i128> {
        match self {
            HostValue::BigInt(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HostValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Field lookup on an object value
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        match self {
            HostValue::Object(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Convert into a JSON value; `undefined` becomes `null`, BigInts
    /// become decimal strings and bytes arrays of numbers
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            HostValue::Undefined | HostValue::Null => serde_json::Value::Null,
            HostValue::Bool(b) => serde_json::Value::Bool(*b),
            HostValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            HostValue::BigInt(n) => serde_json::Value::String(n.to_string()),
            HostValue::String(s) => serde_json::Value::String(s.clone()),
            HostValue::Bytes(bytes) => serde_json::Value::Array(bytes.iter().map(|&b| b.into()).collect()),
            HostValue::Array(items) => serde_json::Value::Array(items.iter().map(HostValue::to_json).collect()),
            HostValue::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .filter(|(_, v)| !matches!(v, HostValue::Undefined))
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => f.write_str("undefined"),
            HostValue::BigInt(n) => write!(f, "{n}n"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(b),
            serde_json::Value::Number(n) => HostValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => HostValue::String(s),
            serde_json::Value::Array(items) => HostValue::Array(items.into_iter().map(HostValue::from).collect()),
            serde_json::Value::Object(map) => {
                HostValue::Object(map.into_iter().map(|(k, v)| (k, HostValue::from(v))).collect())
            }
        }
    }
}

impl From<()> for HostValue {
    fn from(_: ()) -> Self {
        HostValue::Undefined
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Number(value)
    }
}

macro_rules! from_integer {
    ($($ty:ty),*) => {
        $(impl From<$ty> for HostValue {
            fn from(value: $ty) -> Self {
                HostValue::Number(value as f64)
            }
        })*
    };
}

from_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32);

impl From<i128> for HostValue {
    fn from(value: i128) -> Self {
        HostValue::BigInt(value)
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_string())
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(HostValue::Null, Into::into)
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(items: Vec<T>) -> Self {
        HostValue::Array(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Item {
        id: u32,
        name: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_from_serialize_record() {
        let value = HostValue::from_serialize(&Item {
            id: 7,
            name: "lamp".into(),
            tags: vec!["a".into()],
        })
        .unwrap();
        assert_eq!(value.get("id"), Some(&HostValue::Number(7.0)));
        assert_eq!(value.get("name").and_then(HostValue::as_str), Some("lamp"));
        assert_eq!(
            value.get("tags"),
            Some(&HostValue::Array(vec![HostValue::String("a".into())]))
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(HostValue::Undefined.to_string(), "undefined");
        assert_eq!(HostValue::from(vec![1, 2]).to_string(), "[1.0,2.0]");
        assert_eq!(HostValue::from("x").to_string(), "\"x\"");
    }

    #[test]
    fn test_bigint_and_bytes_render() {
        let big = HostValue::BigInt(18_446_744_073_709_551_617);
        assert_eq!(big.to_string(), "18446744073709551617n");
        assert_eq!(big.to_json(), serde_json::json!("18446744073709551617"));
        assert_eq!(HostValue::Bytes(vec![1, 255]).to_json(), serde_json::json!([1, 255]));
    }

    #[test]
    fn test_option_maps_none_to_null() {
        assert_eq!(HostValue::from(None::<bool>), HostValue::Null);
        assert_eq!(HostValue::from(Some(true)), HostValue::Bool(true));
    }
}
