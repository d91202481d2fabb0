//! Typed field values for record fields and extra data

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single typed value held by a record field or extra-data key.
///
/// Serialized with an explicit type tag so a date and a string that render
/// identically are never confused after a round trip through storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Date(NaiveDate),
}

impl FieldValue {
    /// Null, or a string that is empty after trimming
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::String(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Borrow the string content, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Normalized text used for identity matching.
    ///
    /// Strings are trimmed and lower-cased, integral numbers render as
    /// integers (so `123`, `123.0` and `"123"` agree). Empty values have no key.
    pub fn match_key(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_lowercase())
                }
            }
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Integer(i) => Some(i.to_string()),
            FieldValue::Number(n) => {
                if !n.is_finite() {
                    None
                } else if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    Some(format!("{}", *n as i64))
                } else {
                    Some(n.to_string())
                }
            }
            FieldValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }

    /// Single-letter type tag used by the content hash
    pub(crate) fn type_tag(&self) -> char {
        match self {
            FieldValue::Null => 'n',
            FieldValue::Bool(_) => 'b',
            FieldValue::Integer(_) => 'i',
            FieldValue::Number(_) => 'f',
            FieldValue::String(_) => 's',
            FieldValue::Date(_) => 'd',
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::String(s) => write!(f, "{}", s),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Date(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}
