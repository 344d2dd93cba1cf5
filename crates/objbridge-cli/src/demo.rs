//! Demo entry point served by the gateway binary

use objbridge_core::BridgeError;
use objbridge_server::{Native, ParamType, TypeTable};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

/// Root object exposed as id `"0"`
pub struct DemoEntryPoint;

/// Mutable counter handed out by `createCounter`
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    pub fn new(start: i64) -> Self {
        Self {
            value: AtomicI64::new(start),
        }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// Types the demo gateway can dispatch on
pub fn types() -> TypeTable {
    let mut types = TypeTable::new();
    types
        .register::<DemoEntryPoint>("EntryPoint")
        .sync_method("add", &[ParamType::Long, ParamType::Long], |_, args| {
            args.long(0)?
                .checked_add(args.long(1)?)
                .map(Native::Int)
                .ok_or_else(|| BridgeError::invocation("ArithmeticError", "integer overflow"))
        })
        .sync_method("add", &[ParamType::Double, ParamType::Double], |_, args| {
            Ok(Native::Double(args.double(0)? + args.double(1)?))
        })
        .sync_method("echo", &[ParamType::Any], |_, args| Ok(args.get(0)?.clone()))
        .sync_method("createCounter", &[ParamType::Long], |_, args| {
            Ok(Native::object(Counter::new(args.long(0)?)))
        })
        .method(
            "applyCallback",
            &[ParamType::Callable, ParamType::Any],
            |_, args| async move {
                let callable = args.callable(0)?;
                debug!("Applying callback {}", callable.id());
                callable.invoke("invoke", vec![args.get(1)?.clone()]).await
            },
        )
        .display(|_| "EntryPoint".to_string());

    types
        .register::<Counter>("Counter")
        .sync_method("increment", &[], |counter, _| {
            Ok(Native::Int(counter.value.fetch_add(1, Ordering::SeqCst) + 1))
        })
        .sync_method("get", &[], |counter, _| Ok(Native::Int(counter.get())))
        .field_mut(
            "value",
            ParamType::Long,
            |counter| Native::Int(counter.get()),
            |counter, value| {
                if let Some(v) = value.as_i64() {
                    counter.value.store(v, Ordering::SeqCst);
                }
                Ok(())
            },
        )
        .constructor(&[ParamType::Long], |args| {
            let counter = args.long(0).map(|start| Native::object(Counter::new(start)));
            async move { counter }
        })
        .constructor(&[], |_| async { Ok(Native::object(Counter::new(0))) })
        .display(|counter| format!("Counter({})", counter.get()));

    types
}

#[cfg(test)]
mod tests {
    use super::*;
    use objbridge_server::ObjectHandle;
    use std::sync::Arc;

    fn root() -> ObjectHandle {
        Arc::new(DemoEntryPoint)
    }

    #[tokio::test]
    async fn test_add_and_echo() {
        let types = types();
        let sum = types
            .invoke(&root(), "add", vec![Native::Int(2), Native::Int(3)])
            .await
            .unwrap();
        assert_eq!(sum.as_i64(), Some(5));

        let overflow = types
            .invoke(&root(), "add", vec![Native::Int(i64::MAX), Native::Int(1)])
            .await;
        assert!(overflow.is_err());

        let echoed = types.invoke(&root(), "echo", vec!["hi".into()]).await.unwrap();
        assert_eq!(echoed.as_str(), Some("hi"));
    }

    #[tokio::test]
    async fn test_counter_lifecycle() {
        let types = types();
        let counter = types
            .invoke(&root(), "createCounter", vec![Native::Int(4)])
            .await
            .unwrap();
        let Native::Object(handle) = counter else {
            panic!("Expected an object");
        };
        types.invoke(&handle, "increment", vec![]).await.unwrap();
        assert_eq!(types.get_field(&handle, "value").unwrap().as_i64(), Some(5));
        assert_eq!(types.display(&handle), "Counter(5)");

        let fresh = types.construct("Counter", vec![]).await.unwrap();
        assert_eq!(fresh.downcast::<Counter>().map(|c| c.get()), Some(0));
    }
}
