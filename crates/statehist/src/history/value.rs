//! State values stored in history intervals.

use crate::attribute::Quark;
use crate::buffer::{encoded_string_size, SafeBufferReader, SafeBufferWriter};
use crate::error::{Result, StateError};
use std::fmt;

/// Type tag of a serialized [`StateValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// No value.
    Null = 0,
    /// 32-bit signed integer.
    Int = 1,
    /// 64-bit signed integer.
    Long = 2,
    /// 64-bit float.
    Double = 3,
    /// UTF-8 string.
    String = 4,
}

impl ValueType {
    /// Creates a ValueType from its tag byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Null),
            1 => Some(Self::Int),
            2 => Some(Self::Long),
            3 => Some(Self::Double),
            4 => Some(Self::String),
            _ => None,
        }
    }

    /// Returns a short name for error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int => "int",
            Self::Long => "long",
            Self::Double => "double",
            Self::String => "string",
        }
    }
}

/// Value of an attribute over an interval of time.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StateValue {
    /// The attribute holds no value.
    #[default]
    Null,
    /// 32-bit signed integer.
    Int(i32),
    /// 64-bit signed integer.
    Long(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    String(String),
}

impl StateValue {
    /// Returns the type tag of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Null => ValueType::Null,
            Self::Int(_) => ValueType::Int,
            Self::Long(_) => ValueType::Long,
            Self::Double(_) => ValueType::Double,
            Self::String(_) => ValueType::String,
        }
    }

    /// Returns true for [`StateValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the payload of an `Int` or `Long` widened to `i64`.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the float payload, if this is a `Double`.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload, if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn expect_int(&self, quark: Quark) -> Result<Option<i32>> {
        match self {
            Self::Null => Ok(None),
            Self::Int(v) => Ok(Some(*v)),
            other => Err(StateError::TypeMismatch {
                quark,
                expected: ValueType::Int.name(),
                found: other.value_type().name(),
            }),
        }
    }

    /// Returns the number of bytes [`write_to`](Self::write_to) produces.
    pub fn serialized_size(&self) -> usize {
        1 + match self {
            Self::Null => 0,
            Self::Int(_) => 4,
            Self::Long(_) | Self::Double(_) => 8,
            Self::String(s) => encoded_string_size(s),
        }
    }

    /// Writes the type tag followed by the payload.
    pub fn write_to(&self, writer: &mut SafeBufferWriter<'_>) -> Result<()> {
        writer.put_u8(self.value_type() as u8)?;
        match self {
            Self::Null => Ok(()),
            Self::Int(v) => writer.put_i32(*v),
            Self::Long(v) => writer.put_i64(*v),
            Self::Double(v) => writer.put_f64(*v),
            Self::String(s) => writer.put_string(s),
        }
    }

    /// Reads a value written by [`write_to`](Self::write_to).
    pub fn read_from(reader: &mut SafeBufferReader<'_>) -> Result<Self> {
        let tag = reader.get_u8()?;
        let value_type = ValueType::from_u8(tag)
            .ok_or_else(|| StateError::corrupt(format!("unknown value type {tag}")))?;
        Ok(match value_type {
            ValueType::Null => Self::Null,
            ValueType::Int => Self::Int(reader.get_i32()?),
            ValueType::Long => Self::Long(reader.get_i64()?),
            ValueType::Double => Self::Double(reader.get_f64()?),
            ValueType::String => Self::String(reader.get_string()?),
        })
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}L"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i32> for StateValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &StateValue) -> StateValue {
        let mut buf = vec![0u8; value.serialized_size()];
        let mut writer = SafeBufferWriter::new(&mut buf);
        value.write_to(&mut writer).unwrap();
        assert_eq!(writer.remaining(), 0);
        StateValue::read_from(&mut SafeBufferReader::new(&buf)).unwrap()
    }

    #[test]
    fn test_every_type_is_self_describing() {
        for value in [
            StateValue::Null,
            StateValue::Int(-5),
            StateValue::Long(1 << 40),
            StateValue::Double(0.25),
            StateValue::from("RUNNING"),
        ] {
            assert_eq!(roundtrip(&value), value);
        }
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        let buf = [9u8, 0, 0, 0, 0];
        let err = StateValue::read_from(&mut SafeBufferReader::new(&buf)).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_accessors() {
        assert_eq!(StateValue::Int(3).as_long(), Some(3));
        assert_eq!(StateValue::Long(3).as_int(), None);
        assert_eq!(StateValue::from(None::<i32>), StateValue::Null);
        assert!(StateValue::Double(1.0).expect_int(1).is_err());
        assert_eq!(StateValue::Null.expect_int(1).unwrap(), None);
    }
}
