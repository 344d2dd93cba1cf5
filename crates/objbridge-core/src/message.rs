//! Messages exchanged on a bridge channel

use crate::error::BridgeError;
use crate::value::{ErrorEnvelope, ObjectId, Value};

/// What an invocation does to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationKind {
    MethodCall,
    FieldGet,
    FieldSet,
    ConstructorCall,
}

/// A call against an object (or class, for constructors) on the serving side
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    /// Target object; empty for constructor calls
    pub target: ObjectId,
    /// Method or field name; the class name for constructor calls
    pub member: String,
    pub args: Vec<Value>,
    pub kind: InvocationKind,
}

impl InvocationRequest {
    pub fn method(target: impl Into<ObjectId>, member: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            target: target.into(),
            member: member.into(),
            args,
            kind: InvocationKind::MethodCall,
        }
    }

    pub fn field_get(target: impl Into<ObjectId>, field: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            member: field.into(),
            args: Vec::new(),
            kind: InvocationKind::FieldGet,
        }
    }

    pub fn field_set(target: impl Into<ObjectId>, field: impl Into<String>, value: Value) -> Self {
        Self {
            target: target.into(),
            member: field.into(),
            args: vec![value],
            kind: InvocationKind::FieldSet,
        }
    }

    pub fn constructor(class_name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            target: ObjectId::new(""),
            member: class_name.into(),
            args,
            kind: InvocationKind::ConstructorCall,
        }
    }
}

/// Outcome of one invocation
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResponse {
    Success(Value),
    Error(ErrorEnvelope),
}

impl InvocationResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationResponse::Success(_))
    }

    /// Turn an error response into `BridgeError::Remote`
    pub fn into_result(self) -> Result<Value, BridgeError> {
        match self {
            InvocationResponse::Success(value) => Ok(value),
            InvocationResponse::Error(envelope) => Err(BridgeError::Remote(envelope)),
        }
    }
}

/// Every frame kind the codec understands
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    /// Handshake carrying the shared token
    Auth { token: String },
    /// Invocation request
    Call(InvocationRequest),
    /// Drop one reference to a serving-side object
    Release(ObjectId),
    /// Ask the serving side to stop
    Shutdown,
    /// Reply to any of the above
    Response(InvocationResponse),
}

impl BridgeMessage {
    /// Label used in logs
    pub fn kind_label(&self) -> &'static str {
        match self {
            BridgeMessage::Auth { .. } => "auth",
            BridgeMessage::Call(_) => "call",
            BridgeMessage::Release(_) => "release",
            BridgeMessage::Shutdown => "shutdown",
            BridgeMessage::Response(InvocationResponse::Success(_)) => "result",
            BridgeMessage::Response(InvocationResponse::Error(_)) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_becomes_remote_error() {
        let response = InvocationResponse::Error(ErrorEnvelope::new("KeyError", "missing"));
        match response.into_result() {
            Err(BridgeError::Remote(envelope)) => assert_eq!(envelope.error_class_name, "KeyError"),
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_constructor_request_has_empty_target() {
        let request = InvocationRequest::constructor("Counter", vec![Value::Integer(3)]);
        assert_eq!(request.target.as_str(), "");
        assert_eq!(request.member, "Counter");
        assert_eq!(request.kind, InvocationKind::ConstructorCall);
    }
}
