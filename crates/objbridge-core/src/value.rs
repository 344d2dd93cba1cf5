//! Object identifiers and the values that cross the bridge

use serde::{Deserialize, Serialize};
use std::fmt;

/// Id under which every gateway registers its entry point
pub const ENTRY_POINT_ID: &str = "0";

/// Opaque identifier of an object owned by one side of the bridge
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The conventional entry point id
    pub fn entry_point() -> Self {
        Self(ENTRY_POINT_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_entry_point(&self) -> bool {
        self.0 == ENTRY_POINT_ID
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for ObjectId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// A value as it travels on the wire
///
/// `ObjectRef`, `ArrayRef` and `ListRef` name objects owned by the side serving
/// the channel. `Proxy` names an object owned by the calling side, together with
/// the method names it declares.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    ByteArray(Vec<u8>),
    ObjectRef(ObjectId),
    ArrayRef(ObjectId),
    ListRef(ObjectId),
    Proxy {
        id: ObjectId,
        capabilities: Vec<String>,
    },
}

impl Value {
    /// Short type label used in error messages
    pub fn type_label(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::ByteArray(_) => "bytes",
            Value::ObjectRef(_) => "object",
            Value::ArrayRef(_) => "array",
            Value::ListRef(_) => "list",
            Value::Proxy { .. } => "proxy",
        }
    }

    /// The referenced id, if this value is a reference of any kind
    pub fn reference(&self) -> Option<&ObjectId> {
        match self {
            Value::ObjectRef(id) | Value::ArrayRef(id) | Value::ListRef(id) => Some(id),
            Value::Proxy { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

// NaN equals NaN and the sign of zero is significant, so equality follows the
// bit pattern rather than IEEE comparison.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => {
                a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::ByteArray(a), Value::ByteArray(b)) => a == b,
            (Value::ObjectRef(a), Value::ObjectRef(b)) => a == b,
            (Value::ArrayRef(a), Value::ArrayRef(b)) => a == b,
            (Value::ListRef(a), Value::ListRef(b)) => a == b,
            (
                Value::Proxy {
                    id: a,
                    capabilities: ca,
                },
                Value::Proxy {
                    id: b,
                    capabilities: cb,
                },
            ) => a == b && ca == cb,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::ByteArray(v)
    }
}

/// Enough of a failure to rebuild a typed error on the other side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error_class_name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_stack_trace: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(error_class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_class_name: error_class_name.into(),
            message: message.into(),
            remote_stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.remote_stack_trace = Some(trace.into());
        self
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_class_name, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_values_compare_equal() {
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Double(0.0), Value::Double(-0.0));
        assert_ne!(Value::Integer(1), Value::Double(1.0));
    }

    #[test]
    fn test_reference_ids() {
        let id = ObjectId::from(7u64);
        assert_eq!(Value::ListRef(id.clone()).reference(), Some(&id));
        assert_eq!(Value::Integer(7).reference(), None);
        assert!(ObjectId::entry_point().is_entry_point());
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = ErrorEnvelope::new("InvocationError", "boom");
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(json, r#"{"errorClassName":"InvocationError","message":"boom"}"#);
    }
}
