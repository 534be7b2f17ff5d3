//! Marshaling between host types and script values
//!
//! [`IntoScript`] builds script values from host data, [`FromScript`] reads
//! them back. Records go through serde via [`Record`], enums cross as their
//! numeric representation via [`Enum`], and bit sets via [`Flags`].

pub mod de;
mod value;

pub use de::from_host;
pub use value::HostValue;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BridgeError, ConversionError, Result};
use crate::handle::{ScriptType, ValueHandle};
use crate::scope::Scope;

/// Host data that can become a script value
pub trait IntoScript {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle>;
}

/// Host data that can be read from a script value
pub trait FromScript: Sized {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self>;
}

fn conversion(message: impl Into<String>) -> BridgeError {
    BridgeError::Conversion(ConversionError::new(message))
}

fn expect_tag(value: &ValueHandle, expected: &'static str, ok: bool) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(conversion(format!("expected {expected}, found {}", value.tag())))
    }
}

// ============================================================================
// PRIMITIVES
// ============================================================================

impl IntoScript for ValueHandle {
    fn into_script(self, _scope: &mut Scope<'_>) -> Result<ValueHandle> {
        Ok(self)
    }
}

impl IntoScript for &ValueHandle {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.dup(self)
    }
}

impl FromScript for ValueHandle {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
        scope.dup(value)
    }
}

impl IntoScript for () {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.new_undefined()
    }
}

impl FromScript for () {
    fn from_script(_scope: &mut Scope<'_>, _value: &ValueHandle) -> Result<Self> {
        Ok(())
    }
}

impl IntoScript for bool {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.new_bool(self)
    }
}

impl FromScript for bool {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
        expect_tag(value, "boolean", value.tag() == ScriptType::Boolean)?;
        scope.to_bool(value)
    }
}

impl IntoScript for f64 {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.new_number(self)
    }
}

impl FromScript for f64 {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
        expect_tag(value, "number", value.tag() == ScriptType::Number)?;
        scope.to_number(value)
    }
}

impl IntoScript for f32 {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.new_number(self as f64)
    }
}

impl FromScript for f32 {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
        f64::from_script(scope, value).map(|n| n as f32)
    }
}

/// Largest magnitude a script number holds exactly (2^53 - 1)
const MAX_SAFE_INTEGER: u128 = (1 << 53) - 1;

/// Integers cross as numbers while exact, as BigInt beyond that. Both read back.
macro_rules! integer {
    ($($ty:ty),*) => {
        $(
            impl IntoScript for $ty {
                fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
                    let wide = self as i128;
                    if wide.unsigned_abs() <= MAX_SAFE_INTEGER {
                        scope.new_number(wide as f64)
                    } else {
                        scope.new_bigint(wide)
                    }
                }
            }

            impl FromScript for $ty {
                fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
                    let wide = script_integer(scope, value)?;
                    <$ty>::try_from(wide).map_err(|_| {
                        conversion(format!("{wide} is out of range for {}", stringify!($ty)))
                    })
                }
            }
        )*
    };
}

integer!(i8, i16, i32, i64, i128, u8, u16, u32, u64, usize, isize);

fn script_integer(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<i128> {
    match value.tag() {
        ScriptType::BigInt => scope.to_bigint(value),
        ScriptType::Number => {
            let n = scope.to_number(value)?;
            if n.fract() != 0.0 || !n.is_finite() {
                return Err(conversion(format!("expected integer, found {n}")));
            }
            if n.abs() >= 2f64.powi(127) {
                return Err(conversion(format!("{n} is out of range for i128")));
            }
            Ok(n as i128)
        }
        other => Err(conversion(format!("expected integer, found {other}"))),
    }
}

impl IntoScript for String {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.new_string(&self)
    }
}

impl IntoScript for &str {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.new_string(self)
    }
}

impl FromScript for String {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
        expect_tag(value, "string", value.tag() == ScriptType::String)?;
        scope.to_string(value)
    }
}

/// Binary data; crosses as a `Uint8Array` and reads back from either an
/// `ArrayBuffer` or a `Uint8Array`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bytes(pub Vec<u8>);

impl IntoScript for Bytes {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.new_bytes(&self.0)
    }
}

impl FromScript for Bytes {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
        expect_tag(value, "bytes", value.tag() == ScriptType::Bytes)?;
        scope.to_bytes(value).map(Bytes)
    }
}

// ============================================================================
// CONTAINERS
// ============================================================================

impl<T: IntoScript> IntoScript for Option<T> {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        match self {
            Some(value) => value.into_script(scope),
            None => scope.new_null(),
        }
    }
}

/// `null` and `undefined` both read as `None`
impl<T: FromScript> FromScript for Option<T> {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
        if value.tag().is_nullish() {
            Ok(None)
        } else {
            T::from_script(scope, value).map(Some)
        }
    }
}

impl<T: IntoScript> IntoScript for Vec<T> {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        let array = scope.new_array()?;
        for (index, item) in self.into_iter().enumerate() {
            let item = item.into_script(scope)?;
            let raw = scope.into_raw(item)?;
            let target = scope.raw(&array)?;
            let ok = scope.with_abi(|abi, ctx| abi.set_index(ctx, target, index as u32, raw));
            scope.free_raw(raw)?;
            if !ok? {
                return Err(scope.exception());
            }
        }
        Ok(array)
    }
}

impl<T: FromScript> FromScript for Vec<T> {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
        expect_tag(value, "array", value.tag() == ScriptType::Array)?;
        let len = scope.length(value)?.unwrap_or(0);
        let mut out = Vec::with_capacity(len);
        for index in 0..len {
            let item = scope.get_index(value, index as u32)?;
            let converted = T::from_script(scope, &item);
            scope.dispose(&item)?;
            out.push(converted.map_err(|err| match err {
                BridgeError::Conversion(conv) => BridgeError::Conversion(conv.at_index(index)),
                other => other,
            })?);
        }
        Ok(out)
    }
}

impl IntoScript for HostValue {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.new_value(&self)
    }
}

impl IntoScript for &HostValue {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.new_value(self)
    }
}

impl FromScript for HostValue {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
        scope.snapshot(value)
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// A serde record crossing as a plain script object.
///
/// Missing optional fields take their `#[serde(default)]`; conversion
/// errors name the first incompatible field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record<T>(pub T);

impl<T> Record<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Serialize> IntoScript for Record<T> {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.new_record(&self.0)
    }
}

impl<T: DeserializeOwned> FromScript for Record<T> {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
        let snapshot = scope.snapshot(value)?;
        Ok(Record(from_host(&snapshot)?))
    }
}

// ============================================================================
// ENUMS AND FLAGS
// ============================================================================

/// Enumerations that cross the boundary as their numeric representation
pub trait ScriptEnum: Sized + Copy {
    fn to_repr(self) -> i64;
    fn from_repr(repr: i64) -> Option<Self>;
}

/// Declare a fieldless enum together with its [`ScriptEnum`] mapping
#[macro_export]
macro_rules! script_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident = $value:expr),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $($variant = $value),+
        }

        impl $crate::marshal::ScriptEnum for $name {
            fn to_repr(self) -> i64 {
                self as i64
            }

            fn from_repr(repr: i64) -> Option<Self> {
                $(if repr == $name::$variant as i64 {
                    return Some($name::$variant);
                })+
                None
            }
        }
    };
}

/// Wrapper marshaling a [`ScriptEnum`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enum<E>(pub E);

impl<E: ScriptEnum> IntoScript for Enum<E> {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.new_number(self.0.to_repr() as f64)
    }
}

impl<E: ScriptEnum> FromScript for Enum<E> {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
        let repr = i64::from_script(scope, value)?;
        E::from_repr(repr)
            .map(Enum)
            .ok_or_else(|| conversion(format!("{repr} is not a valid {}", std::any::type_name::<E>())))
    }
}

/// Wrapper marshaling a `bitflags` set as its bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags<F>(pub F);

impl<F: bitflags::Flags<Bits = u32>> IntoScript for Flags<F> {
    fn into_script(self, scope: &mut Scope<'_>) -> Result<ValueHandle> {
        scope.new_number(self.0.bits() as f64)
    }
}

impl<F: bitflags::Flags<Bits = u32>> FromScript for Flags<F> {
    fn from_script(scope: &mut Scope<'_>, value: &ValueHandle) -> Result<Self> {
        let bits = u32::from_script(scope, value)?;
        F::from_bits(bits)
            .map(Flags)
            .ok_or_else(|| conversion(format!("unknown flag bits in {bits:#x}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    script_enum! {
        enum Color {
            Red = 0,
            Green = 1,
            Blue = 4,
        }
    }

    #[test]
    fn test_script_enum_repr() {
        assert_eq!(Color::Blue.to_repr(), 4);
        assert_eq!(Color::from_repr(1), Some(Color::Green));
        assert_eq!(Color::from_repr(2), None);
        assert_eq!(Color::from_repr(Color::Red.to_repr()), Some(Color::Red));
    }
}
