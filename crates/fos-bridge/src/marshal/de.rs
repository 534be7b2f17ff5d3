//! serde deserializer over [`HostValue`]
//!
//! Errors carry the path of the first incompatible field.

use serde::de::{
    self, DeserializeOwned, DeserializeSeed, EnumAccess, IntoDeserializer, MapAccess, SeqAccess,
    VariantAccess, Visitor,
};

use super::HostValue;
use crate::error::ConversionError;

/// Deserialize a host type from a value tree
pub fn from_host<T: DeserializeOwned>(value: &HostValue) -> Result<T, ConversionError> {
    T::deserialize(Deserializer { value })
}

struct Deserializer<'a> {
    value: &'a HostValue,
}

fn kind(value: &HostValue) -> &'static str {
    match value {
        HostValue::Undefined => "undefined",
        HostValue::Null => "null",
        HostValue::Bool(_) => "boolean",
        HostValue::Number(_) => "number",
        HostValue::BigInt(_) => "bigint",
        HostValue::String(_) => "string",
        HostValue::Bytes(_) => "bytes",
        HostValue::Array(_) => "array",
        HostValue::Object(_) => "object",
    }
}

fn mismatch(expected: &str, value: &HostValue) -> ConversionError {
    ConversionError::new(format!("expected {expected}, found {}", kind(value)))
}

impl<'de> de::Deserializer<'de> for Deserializer<'_> {
    type Error = ConversionError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.value {
            HostValue::Undefined | HostValue::Null => visitor.visit_unit(),
            HostValue::Bool(b) => visitor.visit_bool(*b),
            HostValue::Number(n) => visit_number(*n, visitor),
            HostValue::BigInt(n) => visit_bigint(*n, visitor),
            HostValue::String(s) => visitor.visit_str(s),
            HostValue::Bytes(bytes) => visitor.visit_seq(byte_seq(bytes)),
            HostValue::Array(items) => visitor.visit_seq(Seq { items: items.iter(), index: 0 }),
            HostValue::Object(fields) => visitor.visit_map(Map {
                fields: fields.iter(),
                pending: None,
            }),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.value {
            HostValue::Bool(b) => visitor.visit_bool(*b),
            other => Err(mismatch("boolean", other)),
        }
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.value {
            HostValue::Number(n) => visitor.visit_f64(*n),
            HostValue::BigInt(n) => visitor.visit_f64(*n as f64),
            other => Err(mismatch("number", other)),
        }
    }

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_f64(visitor)
    }

    fn deserialize_i64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.value {
            HostValue::Number(n) if n.fract() == 0.0 && n.is_finite() => visit_number(*n, visitor),
            HostValue::Number(n) => Err(ConversionError::new(format!("expected integer, found {n}"))),
            HostValue::BigInt(n) => visit_bigint(*n, visitor),
            other => Err(mismatch("integer", other)),
        }
    }

    fn deserialize_i8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_i128<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_u128<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_i64(visitor)
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.value {
            HostValue::String(s) => visitor.visit_str(s),
            other => Err(mismatch("string", other)),
        }
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.value {
            HostValue::Bytes(bytes) => visitor.visit_bytes(bytes),
            _ => self.deserialize_seq(visitor),
        }
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.value {
            HostValue::Bytes(bytes) => visitor.visit_byte_buf(bytes.clone()),
            _ => self.deserialize_seq(visitor),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        if self.value.is_nullish() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.value {
            HostValue::Undefined | HostValue::Null => visitor.visit_unit(),
            other => Err(mismatch("null", other)),
        }
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.value {
            HostValue::Array(items) => visitor.visit_seq(Seq { items: items.iter(), index: 0 }),
            HostValue::Bytes(bytes) => visitor.visit_seq(byte_seq(bytes)),
            other => Err(mismatch("array", other)),
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.value {
            HostValue::Object(fields) => visitor.visit_map(Map {
                fields: fields.iter(),
                pending: None,
            }),
            other => Err(mismatch("object", other)),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.deserialize_map(visitor)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self.value {
            HostValue::String(s) => visitor.visit_enum(s.as_str().into_deserializer()),
            HostValue::Object(fields) if fields.len() == 1 => {
                let (variant, value) = &fields[0];
                visitor
                    .visit_enum(Enum { variant, value })
                    .map_err(|err| err.at_key(variant))
            }
            other => Err(mismatch("enum variant", other)),
        }
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }
}

/// Integral numbers visit as integers so integer targets accept them
fn visit_number<'de, V: Visitor<'de>>(n: f64, visitor: V) -> Result<V::Value, ConversionError> {
    if n.fract() == 0.0 && n.is_finite() {
        if n >= 0.0 && n <= u64::MAX as f64 {
            return visitor.visit_u64(n as u64);
        }
        if n >= i64::MIN as f64 {
            return visitor.visit_i64(n as i64);
        }
    }
    visitor.visit_f64(n)
}

fn byte_seq(bytes: &[u8]) -> de::value::SeqDeserializer<std::iter::Copied<std::slice::Iter<'_, u8>>, ConversionError> {
    de::value::SeqDeserializer::new(bytes.iter().copied())
}

/// BigInts visit as the narrowest integer that holds them
fn visit_bigint<'de, V: Visitor<'de>>(n: i128, visitor: V) -> Result<V::Value, ConversionError> {
    if let Ok(n) = u64::try_from(n) {
        return visitor.visit_u64(n);
    }
    if let Ok(n) = i64::try_from(n) {
        return visitor.visit_i64(n);
    }
    visitor.visit_i128(n)
}

struct Seq<'a> {
    items: std::slice::Iter<'a, HostValue>,
    index: usize,
}

impl<'de> SeqAccess<'de> for Seq<'_> {
    type Error = ConversionError;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>, Self::Error> {
        let Some(value) = self.items.next() else {
            return Ok(None);
        };
        let index = self.index;
        self.index += 1;
        seed.deserialize(Deserializer { value })
            .map(Some)
            .map_err(|err| err.at_index(index))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

struct Map<'a> {
    fields: std::slice::Iter<'a, (String, HostValue)>,
    pending: Option<(&'a str, &'a HostValue)>,
}

impl<'de> MapAccess<'de> for Map<'_> {
    type Error = ConversionError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error> {
        for (key, value) in self.fields.by_ref() {
            // Absent-valued fields behave like missing ones
            if matches!(value, HostValue::Undefined) {
                continue;
            }
            self.pending = Some((key, value));
            return seed
                .deserialize(key.as_str().into_deserializer())
                .map(Some)
                .map_err(|err: ConversionError| err.at_key(key));
        }
        Ok(None)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, Self::Error> {
        let (key, value) = self
            .pending
            .take()
            .ok_or_else(|| ConversionError::new("value requested before key"))?;
        seed.deserialize(Deserializer { value }).map_err(|err| err.at_key(key))
    }
}

struct Enum<'a> {
    variant: &'a str,
    value: &'a HostValue,
}

impl<'de, 'a> EnumAccess<'de> for Enum<'a> {
    type Error = ConversionError;
    type Variant = Deserializer<'a>;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> Result<(V::Value, Self::Variant), Self::Error> {
        let variant = seed.deserialize(self.variant.into_deserializer())?;
        Ok((variant, Deserializer { value: self.value }))
    }
}

impl<'de> VariantAccess<'de> for Deserializer<'_> {
    type Error = ConversionError;

    fn unit_variant(self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value, Self::Error> {
        seed.deserialize(self)
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value, Self::Error> {
        de::Deserializer::deserialize_seq(self, visitor)
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        de::Deserializer::deserialize_map(self, visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
        name: String,
        #[serde(default)]
        price: f64,
        tags: Option<Vec<String>>,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        items: Vec<Item>,
    }

    fn object(fields: &[(&str, HostValue)]) -> HostValue {
        HostValue::Object(fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[test]
    fn test_record_with_defaults() {
        let value = object(&[("id", HostValue::Number(3.0)), ("name", "lamp".into())]);
        let item: Item = from_host(&value).unwrap();
        assert_eq!(
            item,
            Item {
                id: 3,
                name: "lamp".into(),
                price: 0.0,
                tags: None
            }
        );
    }

    #[test]
    fn test_undefined_field_counts_as_missing() {
        let value = object(&[
            ("id", HostValue::Number(1.0)),
            ("name", "x".into()),
            ("price", HostValue::Undefined),
        ]);
        let item: Item = from_host(&value).unwrap();
        assert_eq!(item.price, 0.0);
    }

    #[test]
    fn test_error_path_points_at_field() {
        let bad = object(&[("id", HostValue::Number(2.0)), ("name", HostValue::Number(5.0))]);
        let good = object(&[("id", HostValue::Number(1.0)), ("name", "ok".into())]);
        let value = object(&[("items", HostValue::Array(vec![good.clone(), good, bad]))]);
        let err = from_host::<Order>(&value).unwrap_err();
        assert_eq!(err.field(), "items[2].name");
    }

    #[test]
    fn test_missing_required_field() {
        let value = object(&[("id", HostValue::Number(1.0))]);
        let err = from_host::<Item>(&value).unwrap_err();
        assert_eq!(err.field(), "name");
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ledger {
        total: i128,
        small: u64,
        digest: Vec<u8>,
    }

    #[test]
    fn test_bigint_and_bytes_fields() {
        let value = object(&[
            ("total", HostValue::BigInt(-(1i128 << 100))),
            ("small", HostValue::BigInt(42)),
            ("digest", HostValue::Bytes(vec![0xde, 0xad])),
        ]);
        let ledger: Ledger = from_host(&value).unwrap();
        assert_eq!(ledger.total, -(1i128 << 100));
        assert_eq!(ledger.small, 42);
        assert_eq!(ledger.digest, vec![0xde, 0xad]);
    }

    #[test]
    fn test_fractional_into_integer_fails() {
        let value = object(&[("id", HostValue::Number(1.5)), ("name", "x".into())]);
        let err = from_host::<Item>(&value).unwrap_err();
        assert_eq!(err.field(), "id");
    }

    #[test]
    fn test_externally_tagged_enum() {
        #[derive(Debug, Deserialize, PartialEq)]
        enum Shape {
            Dot,
            Circle { radius: f64 },
        }
        assert_eq!(from_host::<Shape>(&"Dot".into()).unwrap(), Shape::Dot);
        let circle = object(&[("Circle", object(&[("radius", HostValue::Number(2.0))]))]);
        assert_eq!(from_host::<Shape>(&circle).unwrap(), Shape::Circle { radius: 2.0 });
    }
}
