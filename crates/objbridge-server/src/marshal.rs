//! Conversion between wire values and native values
//!
//! Which side owns a referenced object depends on the role this process plays on
//! the channel. References (`r`, `l`, `a`) always name objects of the serving
//! side and proxies (`f`) objects of the calling side, so the same value means a
//! local object on one channel and a remote one on the other.

use crate::builtins::{BridgeArray, BridgeList};
use crate::callback::{CallbackClient, ProxyHandle};
use crate::invokable::{Native, TypeTable};
use crate::registry::{ObjectHandle, Registry, Scope};
use objbridge_core::{Result, Value};
use std::sync::{Arc, Weak};

/// Role of this process on the channel a value travels over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Answering requests (primary channel)
    Serving,
    /// Issuing requests (callback channel)
    Calling,
}

/// Converts values for one channel, registering outgoing local objects in `scope`
pub struct Marshaller<'a> {
    registry: &'a Registry,
    types: &'a TypeTable,
    callbacks: Weak<CallbackClient>,
    scope: Scope,
    role: Role,
}

impl<'a> Marshaller<'a> {
    pub fn new(
        registry: &'a Registry,
        types: &'a TypeTable,
        callbacks: Weak<CallbackClient>,
        scope: Scope,
        role: Role,
    ) -> Self {
        Self {
            registry,
            types,
            callbacks,
            scope,
            role,
        }
    }

    /// Turn an incoming value into a native one, resolving local references
    pub fn to_native(&self, value: Value) -> Result<Native> {
        Ok(match value {
            Value::Null => Native::Null,
            Value::Boolean(v) => Native::Bool(v),
            Value::Integer(v) => Native::Int(v),
            Value::Double(v) => Native::Double(v),
            Value::String(v) => Native::Str(v),
            Value::ByteArray(v) => Native::Bytes(v),
            Value::ObjectRef(id) | Value::ArrayRef(id) | Value::ListRef(id) => match self.role {
                Role::Serving => Native::Object(self.registry.resolve(&id)?),
                Role::Calling => Native::Remote(ProxyHandle::new(id, Vec::new(), self.callbacks.clone())),
            },
            Value::Proxy { id, capabilities } => match self.role {
                Role::Serving => {
                    Native::Remote(ProxyHandle::new(id, capabilities, self.callbacks.clone()))
                }
                Role::Calling => Native::Object(self.registry.resolve(&id)?),
            },
        })
    }

    pub fn to_natives(&self, values: Vec<Value>) -> Result<Vec<Native>> {
        values.into_iter().map(|v| self.to_native(v)).collect()
    }

    /// Turn an outgoing native value into a wire value, registering local objects
    pub fn to_value(&self, native: Native) -> Result<Value> {
        Ok(match native {
            Native::Null => Value::Null,
            Native::Bool(v) => Value::Boolean(v),
            Native::Int(v) => Value::Integer(v),
            Native::Double(v) => Value::Double(v),
            Native::Str(v) => Value::String(v),
            Native::Bytes(v) => Value::ByteArray(v),
            Native::Object(handle) => self.local_reference(handle)?,
            Native::List(items) => self.local_reference(Arc::new(BridgeList::new(items)))?,
            Native::Array(items) => self.local_reference(Arc::new(BridgeArray::new(items)))?,
            Native::Remote(proxy) => match self.role {
                Role::Serving => Value::Proxy {
                    id: proxy.id().clone(),
                    capabilities: proxy.capabilities().to_vec(),
                },
                Role::Calling => Value::ObjectRef(proxy.id().clone()),
            },
        })
    }

    pub fn to_values(&self, natives: Vec<Native>) -> Result<Vec<Value>> {
        natives.into_iter().map(|n| self.to_value(n)).collect()
    }

    fn local_reference(&self, handle: ObjectHandle) -> Result<Value> {
        let is_list = handle.is::<BridgeList>();
        let is_array = handle.is::<BridgeArray>();
        let capabilities = match self.role {
            Role::Calling => self.types.method_names(&handle),
            Role::Serving => Vec::new(),
        };
        let id = self.registry.register(handle, self.scope)?;

        Ok(match self.role {
            Role::Serving if is_list => Value::ListRef(id),
            Role::Serving if is_array => Value::ArrayRef(id),
            Role::Serving => Value::ObjectRef(id),
            Role::Calling => Value::Proxy { id, capabilities },
        })
    }
}
