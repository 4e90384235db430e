//! Blockline value representation.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::fmt;

/// A materialized Blockline value.
///
/// Untyped scalars are always `String`; every other scalar variant comes from
/// an inline type hint or a composed type.
#[derive(Clone, PartialEq)]
pub enum Value {
    /// Typed null, from `(null)`.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Arbitrary-precision integer.
    Integer(BigInt),
    /// 64-bit floating-point number.
    Float(f64),
    /// Decimal number kept as its validated source digits.
    Decimal(String),
    /// UTF-8 string.
    String(String),
    /// Calendar date.
    Date(NaiveDate),
    /// Wall-clock time.
    Time(NaiveTime),
    /// Date and time with offset (naive inputs are taken as UTC).
    DateTime(DateTime<FixedOffset>),
    /// UUID bytes.
    Uuid([u8; 16]),
    /// Byte array, from `bin`, `hex` or `b64`.
    Bytes(Vec<u8>),
    /// Sequence of values, including tuple rows.
    Array(Vec<Value>),
    /// Ordered mapping.
    Object(IndexMap<String, Value>),
    /// A reference left unexpanded: its target never resolved, or expanding
    /// it again would cycle.
    Reference(String),
}

impl Value {
    /// Returns `true` if this value is a typed null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Target id of an unexpanded reference.
    pub fn as_reference(&self) -> Option<&str> {
        match self {
            Value::Reference(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<&BigInt> {
        match self {
            Value::Integer(n) => Some(n),
            _ => None,
        }
    }

    /// The integer as `i64`, when it fits.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_integer()?.to_i64()
    }

    /// Numeric view of `Integer`, `Float` and `Decimal` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => n.to_f64(),
            Value::Float(f) => Some(*f),
            Value::Decimal(d) => d.parse().ok(),
            _ => None,
        }
    }

    /// Text of `String` and `Decimal` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Decimal(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::DateTime(dt) => Some(dt.date_naive()),
            _ => None,
        }
    }

    /// Raw bytes of `Bytes` and `Uuid` values.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b.as_slice()),
            Value::Uuid(u) => Some(&u[..]),
            _ => None,
        }
    }

    /// Items of an array, or the fields of a tuple row.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(entries) => Some(entries),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(n) => write!(f, "{}n", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Decimal(d) => write!(f, "{}d", d),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Date(d) => write!(f, "{}", d),
            Value::Time(t) => write!(f, "{}", t),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::Uuid(u) => {
                for (i, byte) in u.iter().enumerate() {
                    if matches!(i, 4 | 6 | 8 | 10) {
                        write!(f, "-")?;
                    }
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Array(arr) => f.debug_list().entries(arr).finish(),
            Value::Object(obj) => f.debug_map().entries(obj).finish(),
            Value::Bytes(b) => {
                write!(f, "<")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, ">")
            }
            Value::Reference(id) => write!(f, "&{}", id),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<BigInt> for Value {
    fn from(n: BigInt) -> Self {
        Value::Integer(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(BigInt::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(arr: Vec<Value>) -> Self {
        Value::Array(arr)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(obj: IndexMap<String, Value>) -> Self {
        Value::Object(obj)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}
