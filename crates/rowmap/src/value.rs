//! Untyped column values and the conversions into typed record fields.

use std::fmt;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Timelike};
use rowmap_error::{Result, fatal};

/// Text format used when timestamps are bound or stored as text. Fractional
/// seconds are written only when present.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Formats accepted when parsing a timestamp out of text. `%.f` also
/// matches when no fractional seconds are present.
const TIMESTAMP_PARSE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// A single untyped value, either bound as a statement argument or read
/// back from a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    /// Unsigned integers that don't fit in an i64.
    UInt(u64),
    Float(f64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Human readable rendering used when logging statements.
    pub fn render(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Int(v) => v.to_string(),
            Self::UInt(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Text(v) => format!("'{}'", v.replace('\'', "''")),
            Self::Blob(v) => {
                let mut s = String::with_capacity(v.len() * 2 + 3);
                s.push_str("x'");
                for b in v {
                    s.push_str(&format!("{b:02x}"));
                }
                s.push('\'');
                s
            }
            Self::Timestamp(v) => format!("'{}'", v.format(TIMESTAMP_FORMAT)),
        }
    }
}

/// Plain rendering, used for composite primary keys.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{}", if *v { 1 } else { 0 }),
            Self::Text(v) => write!(f, "{v}"),
            Self::Blob(v) => write!(f, "{}", String::from_utf8_lossy(v)),
            Self::Timestamp(v) => write!(f, "{}", v.format(TIMESTAMP_FORMAT)),
        }
    }
}

/// Structural type tag of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Int,
    UInt,
    Float,
    Text,
    Bytes,
    Timestamp,
    /// Passed through untouched.
    Opaque,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Float => "float",
            Self::Text => "text",
            Self::Bytes => "bytes",
            Self::Timestamp => "timestamp",
            Self::Opaque => "opaque",
        };
        write!(f, "{s}")
    }
}

/// A type that can live in a mapped record field.
///
/// `from_value` is where untyped store values get coerced into the field's
/// static type. NULL decodes to the type's zero value, use `Option<T>` to
/// observe NULLs.
pub trait FieldValue: Sized {
    const FIELD_TYPE: FieldType;

    fn to_value(&self) -> Value;

    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch(value: &Value, target: &str) -> rowmap_error::MapperError {
    fatal!("cannot convert {value:?} into {target}")
}

fn is_null_text(s: &str) -> bool {
    s.is_empty() || s.eq_ignore_ascii_case("null")
}

/// Decode any integer-like value. `None` means NULL.
fn decode_integer(value: &Value, target: &str) -> Result<Option<i128>> {
    match value {
        Value::Null => Ok(None),
        Value::Int(v) => Ok(Some(*v as i128)),
        Value::UInt(v) => Ok(Some(*v as i128)),
        Value::Bool(v) => Ok(Some(*v as i128)),
        Value::Float(v) => {
            if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e38 {
                Ok(Some(*v as i128))
            } else {
                Err(mismatch(value, target))
            }
        }
        Value::Text(s) => {
            let s = s.trim();
            if is_null_text(s) {
                return Ok(None);
            }
            if let Ok(v) = s.parse::<i128>() {
                return Ok(Some(v));
            }
            match s.parse::<f64>() {
                Ok(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e38 => Ok(Some(f as i128)),
                _ => Err(mismatch(value, target)),
            }
        }
        _ => Err(mismatch(value, target)),
    }
}

macro_rules! impl_integer_field {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl FieldValue for $ty {
                const FIELD_TYPE: FieldType = FieldType::$tag;

                #[allow(unreachable_patterns, clippy::unnecessary_cast)]
                fn to_value(&self) -> Value {
                    match i64::try_from(*self) {
                        Ok(v) => Value::Int(v),
                        Err(_) => Value::UInt(*self as u64),
                    }
                }

                fn from_value(value: Value) -> Result<Self> {
                    match decode_integer(&value, stringify!($ty))? {
                        None => Ok(0),
                        Some(v) => <$ty>::try_from(v).map_err(|_| {
                            fatal!("value {v} out of range for {}", stringify!($ty))
                        }),
                    }
                }
            }
        )*
    };
}

impl_integer_field!(
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    isize => Int,
    u8 => UInt,
    u16 => UInt,
    u32 => UInt,
    u64 => UInt,
    usize => UInt,
);

fn decode_float(value: &Value, target: &str) -> Result<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        Value::Int(v) => Ok(Some(*v as f64)),
        Value::UInt(v) => Ok(Some(*v as f64)),
        Value::Float(v) => Ok(Some(*v)),
        Value::Bool(v) => Ok(Some(if *v { 1.0 } else { 0.0 })),
        Value::Text(s) => {
            let s = s.trim();
            if is_null_text(s) {
                return Ok(None);
            }
            s.parse::<f64>()
                .map(Some)
                .map_err(|_| mismatch(value, target))
        }
        _ => Err(mismatch(value, target)),
    }
}

impl FieldValue for f64 {
    const FIELD_TYPE: FieldType = FieldType::Float;

    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(decode_float(&value, "f64")?.unwrap_or(0.0))
    }
}

impl FieldValue for f32 {
    const FIELD_TYPE: FieldType = FieldType::Float;

    fn to_value(&self) -> Value {
        Value::Float(*self as f64)
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(decode_float(&value, "f32")?.unwrap_or(0.0) as f32)
    }
}

impl FieldValue for bool {
    const FIELD_TYPE: FieldType = FieldType::Bool;

    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::Null => Ok(false),
            Value::Bool(v) => Ok(*v),
            Value::Int(v) => Ok(*v != 0),
            Value::UInt(v) => Ok(*v != 0),
            Value::Float(v) => Ok(*v != 0.0),
            Value::Text(t) => {
                let t = t.trim();
                if t.eq_ignore_ascii_case("t")
                    || t.eq_ignore_ascii_case("true")
                    || t.eq_ignore_ascii_case("1")
                {
                    Ok(true)
                } else if t.eq_ignore_ascii_case("f")
                    || t.eq_ignore_ascii_case("false")
                    || t.eq_ignore_ascii_case("0")
                    || is_null_text(t)
                {
                    Ok(false)
                } else {
                    Err(mismatch(&value, "bool"))
                }
            }
            _ => Err(mismatch(&value, "bool")),
        }
    }
}

impl FieldValue for String {
    const FIELD_TYPE: FieldType = FieldType::Text;

    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(String::new()),
            Value::Text(s) => Ok(s),
            Value::Blob(b) => String::from_utf8(b)
                .map_err(|e| fatal!("blob is not valid utf-8 text: {e}")),
            other @ (Value::Int(_)
            | Value::UInt(_)
            | Value::Float(_)
            | Value::Bool(_)
            | Value::Timestamp(_)) => Ok(other.to_string()),
        }
    }
}

impl FieldValue for Vec<u8> {
    const FIELD_TYPE: FieldType = FieldType::Bytes;

    fn to_value(&self) -> Value {
        Value::Blob(self.clone())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Vec::new()),
            Value::Blob(b) => Ok(b),
            Value::Text(s) => Ok(s.into_bytes()),
            other => Err(mismatch(&other, "bytes")),
        }
    }
}

/// Parse a timestamp from the fixed textual format (a bare date is taken as
/// midnight).
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    for format in TIMESTAMP_PARSE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

impl FieldValue for NaiveDateTime {
    const FIELD_TYPE: FieldType = FieldType::Timestamp;

    fn to_value(&self) -> Value {
        Value::Timestamp(*self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match &value {
            Value::Null => Ok(NaiveDateTime::default()),
            Value::Timestamp(ts) => Ok(*ts),
            Value::Text(s) if is_null_text(s.trim()) => Ok(NaiveDateTime::default()),
            Value::Text(s) => parse_timestamp(s).ok_or_else(|| mismatch(&value, "timestamp")),
            Value::Int(secs) => DateTime::from_timestamp(*secs, 0)
                .map(|dt| dt.naive_utc())
                .ok_or_else(|| mismatch(&value, "timestamp")),
            _ => Err(mismatch(&value, "timestamp")),
        }
    }
}

impl FieldValue for Value {
    const FIELD_TYPE: FieldType = FieldType::Opaque;

    fn to_value(&self) -> Value {
        self.clone()
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    const FIELD_TYPE: FieldType = T::FIELD_TYPE;

    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            v => T::from_value(v).map(Some),
        }
    }
}

macro_rules! impl_from_for_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    v.to_value()
                }
            }
        )*
    };
}

impl_from_for_value!(
    i8,
    i16,
    i32,
    i64,
    isize,
    u8,
    u16,
    u32,
    u64,
    usize,
    f32,
    f64,
    bool,
    String,
    Vec<u8>,
    NaiveDateTime
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: FieldValue> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.to_value()
    }
}

/// Current local time truncated to whole seconds, matching what a
/// round-trip through the textual timestamp format preserves.
pub fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}
