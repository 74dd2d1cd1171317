//! Value types: declared types, status and timestamped values

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type code of a value node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeCode {
    String,
    Blob,
    Null,
    Boolean,
    SByte,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Single,
    Double,
    DateTime,
    TimeSpan,
    Object,
    Variant,
}

impl TypeCode {
    /// Inclusive integer range for integral type codes
    fn integer_range(&self) -> Option<(i128, i128)> {
        match self {
            TypeCode::SByte => Some((i8::MIN as i128, i8::MAX as i128)),
            TypeCode::Byte => Some((0, u8::MAX as i128)),
            TypeCode::Int16 => Some((i16::MIN as i128, i16::MAX as i128)),
            TypeCode::UInt16 => Some((0, u16::MAX as i128)),
            TypeCode::Int32 => Some((i32::MIN as i128, i32::MAX as i128)),
            TypeCode::UInt32 => Some((0, u32::MAX as i128)),
            TypeCode::Int64 => Some((i64::MIN as i128, i64::MAX as i128)),
            TypeCode::UInt64 => Some((0, u64::MAX as i128)),
            _ => None,
        }
    }

    /// Check whether a scalar JSON value is representable as this type
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        if let Some((min, max)) = self.integer_range() {
            let n = value
                .as_i64()
                .map(i128::from)
                .or_else(|| value.as_u64().map(i128::from));
            return n.map(|n| n >= min && n <= max).unwrap_or(false);
        }

        match self {
            TypeCode::Boolean => value.is_boolean(),
            TypeCode::Single | TypeCode::Double => value.is_number(),
            TypeCode::String | TypeCode::Blob | TypeCode::DateTime => value.is_string(),
            TypeCode::TimeSpan => value.is_number() || value.is_string(),
            TypeCode::Null => value.is_null(),
            TypeCode::Object | TypeCode::Variant => true,
            // integral codes handled above
            _ => false,
        }
    }
}

/// Declared value type of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueType {
    pub type_code: TypeCode,
    #[serde(default)]
    pub is_array: bool,
}

impl ValueType {
    /// Scalar value type
    pub fn scalar(type_code: TypeCode) -> Self {
        Self {
            type_code,
            is_array: false,
        }
    }

    /// Array value type
    pub fn array(type_code: TypeCode) -> Self {
        Self {
            type_code,
            is_array: true,
        }
    }

    /// Scalar boolean
    pub fn boolean() -> Self {
        Self::scalar(TypeCode::Boolean)
    }

    /// Check whether a value can be stored in a node of this type
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        if self.is_array {
            value
                .as_array()
                .map(|items| items.iter().all(|v| self.type_code.accepts(v)))
                .unwrap_or(false)
        } else {
            self.type_code.accepts(value)
        }
    }
}

/// Quality status attached to a value or write result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub is_bad: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
}

impl Status {
    pub fn good() -> Self {
        Self::default()
    }

    pub fn bad(status_text: impl Into<String>) -> Self {
        Self {
            is_bad: true,
            status_text: Some(status_text.into()),
        }
    }

    pub fn is_good(&self) -> bool {
        !self.is_bad
    }

    /// Status text or a generic placeholder
    pub fn text(&self) -> &str {
        self.status_text.as_deref().unwrap_or("Error")
    }
}

/// A value with its status and the time it was produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeValue {
    pub value: serde_json::Value,
    #[serde(default)]
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

impl NodeValue {
    /// Create a good value stamped with the current time
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            status: Status::good(),
            timestamp: Utc::now(),
        }
    }

    /// Create a value carrying a bad status
    pub fn bad(value: impl Into<serde_json::Value>, status_text: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            status: Status::bad(status_text),
            timestamp: Utc::now(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }
}
