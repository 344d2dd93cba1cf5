//! # objbridge-core
//!
//! Core types for the object bridge protocol.
//!
//! This crate provides the data model shared by every bridge component:
//! - Object identifiers and the wire `Value` union
//! - Invocation requests and responses
//! - Error envelopes and the bridge error type

pub mod error;
pub mod message;
pub mod value;

pub use error::{BridgeError, Result};
pub use message::{BridgeMessage, InvocationKind, InvocationRequest, InvocationResponse};
pub use value::{ENTRY_POINT_ID, ErrorEnvelope, ObjectId, Value};
