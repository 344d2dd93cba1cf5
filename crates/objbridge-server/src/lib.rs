//! # objbridge-server
//!
//! Serving side of the object bridge.
//!
//! This crate provides:
//! - `Registry` mapping object ids to live local objects
//! - `TypeTable` declaring what can be invoked on each exposed type
//! - `Dispatcher` running inbound calls against the registry
//! - Primary channel connection workers and the callback channel
//! - `Gateway` tying them together behind one listener

pub mod builtins;
pub mod callback;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod gateway;
pub mod invokable;
pub mod marshal;
pub mod registry;

pub use builtins::{BridgeArray, BridgeList};
pub use callback::{CallbackClient, ProxyHandle};
pub use config::GatewayConfig;
pub use dispatcher::Dispatcher;
pub use gateway::Gateway;
pub use invokable::{Args, Native, ParamType, TypeBuilder, TypeTable};
pub use registry::{ConnectionId, ObjectHandle, Registry, Scope};
