//! Invocation dispatcher
//!
//! Runs one inbound request against the local objects: resolves the target,
//! converts arguments, calls through the type table and converts the result.
//! Every failure comes back as an error response; nothing escapes to the
//! connection worker.

use crate::callback::CallbackClient;
use crate::invokable::{Native, TypeTable};
use crate::marshal::{Marshaller, Role};
use crate::registry::{Registry, Scope};
use objbridge_core::{
    BridgeError, ErrorEnvelope, InvocationKind, InvocationRequest, InvocationResponse, Result,
    Value,
};
use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{Context, Poll};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error};

/// Error class reported when a method panics
pub const PANIC_ERROR_CLASS: &str = "PanicError";

/// Executes invocation requests against the local registry
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    types: Arc<TypeTable>,
    callbacks: Arc<CallbackClient>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        types: Arc<TypeTable>,
        callbacks: Arc<CallbackClient>,
    ) -> Self {
        install_panic_hook();
        Self {
            registry,
            types,
            callbacks,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run a request on its own task and turn the outcome into a response
    ///
    /// Objects created by the call are registered under `scope`. Dropping the
    /// returned future aborts the call.
    pub async fn dispatch(&self, request: InvocationRequest, scope: Scope) -> InvocationResponse {
        let label = format!("{}.{}", request.target, request.member);
        let this = self.clone();
        let task = AbortOnDrop(tokio::spawn(CatchPanic(Box::pin(async move {
            this.execute(request, scope).await
        }))));

        match task.await {
            Ok(Ok(Ok(value))) => InvocationResponse::Success(value),
            Ok(Ok(Err(e))) => {
                debug!("Call {} failed: {}", label, e);
                InvocationResponse::Error(e.to_envelope())
            }
            Ok(Err(report)) => {
                error!("Call {} panicked: {}", label, report.message);
                let envelope = ErrorEnvelope::new(PANIC_ERROR_CLASS, report.message);
                InvocationResponse::Error(match report.location {
                    Some(location) => envelope.with_stack_trace(format!("at {}", location)),
                    None => envelope,
                })
            }
            Err(join_error) => InvocationResponse::Error(
                BridgeError::ConnectionLost(join_error.to_string()).to_envelope(),
            ),
        }
    }

    async fn execute(&self, request: InvocationRequest, scope: Scope) -> Result<Value> {
        let marshal = Marshaller::new(
            &self.registry,
            &self.types,
            Arc::downgrade(&self.callbacks),
            scope,
            Role::Serving,
        );
        let mut args = marshal.to_natives(request.args)?;

        let result = match request.kind {
            InvocationKind::MethodCall => {
                let target = self.registry.resolve(&request.target)?;
                self.types.invoke(&target, &request.member, args).await?
            }
            InvocationKind::FieldGet => {
                let target = self.registry.resolve(&request.target)?;
                self.types.get_field(&target, &request.member)?
            }
            InvocationKind::FieldSet => {
                let target = self.registry.resolve(&request.target)?;
                if args.len() != 1 {
                    return Err(BridgeError::SerializationError(format!(
                        "Field set takes one value, got {}",
                        args.len()
                    )));
                }
                let value = args.pop().unwrap_or(Native::Null);
                self.types.set_field(&target, &request.member, value)?;
                Native::Null
            }
            InvocationKind::ConstructorCall => self.types.construct(&request.member, args).await?,
        };

        marshal.to_value(result)
    }
}

thread_local! {
    static PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

// Records where the last panic on this thread happened, then defers to the
// previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                PANIC_LOCATION.with(|slot| *slot.borrow_mut() = Some(location.to_string()));
            }
            previous(info);
        }));
    });
}

struct PanicReport {
    message: String,
    location: Option<String>,
}

/// Resolves to `Err` instead of unwinding when the inner future panics
struct CatchPanic<F>(Pin<Box<F>>);

impl<F: Future> Future for CatchPanic<F> {
    type Output = std::result::Result<F::Output, PanicReport>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.0.as_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            // The hook ran on this thread just before unwinding
            Err(payload) => Poll::Ready(Err(PanicReport {
                message: panic_message(payload),
                location: PANIC_LOCATION.with(|slot| slot.borrow_mut().take()),
            })),
        }
    }
}

/// Aborts the spawned call when the connection worker awaiting it goes away
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = std::result::Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Method panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackSettings;
    use crate::invokable::ParamType;
    use objbridge_client::ClientOptions;
    use objbridge_core::ObjectId;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Calculator {
        memory: AtomicI64,
    }

    struct Counter(AtomicI64);

    fn dispatcher() -> (Dispatcher, Scope) {
        let mut types = TypeTable::new();
        types
            .register::<Calculator>("Calculator")
            .sync_method("add", &[ParamType::Long, ParamType::Long], |_, args| {
                Ok(Native::Int(args.long(0)? + args.long(1)?))
            })
            .sync_method("divide", &[ParamType::Long, ParamType::Long], |_, args| {
                let divisor = args.long(1)?;
                if divisor == 0 {
                    return Err(BridgeError::invocation("ArithmeticError", "division by zero"));
                }
                Ok(Native::Int(args.long(0)? / divisor))
            })
            .sync_method("counter", &[], |_, _| Ok(Native::object(Counter(AtomicI64::new(0)))))
            .sync_method("explode", &[], |_, _| panic!("kaboom"))
            .method("slowCounter", &[ParamType::Long], |_, args| async move {
                tokio::time::sleep(Duration::from_millis(args.long(0)? as u64)).await;
                Ok(Native::object(Counter(AtomicI64::new(0))))
            })
            .field_mut(
                "memory",
                ParamType::Long,
                |c| Native::Int(c.memory.load(Ordering::SeqCst)),
                |c, v| {
                    c.memory.store(v.as_i64().unwrap_or_default(), Ordering::SeqCst);
                    Ok(())
                },
            );
        types
            .register::<Counter>("Counter")
            .sync_method("increment", &[], |c, _| {
                Ok(Native::Int(c.0.fetch_add(1, Ordering::SeqCst) + 1))
            })
            .constructor(&[ParamType::Long], |args| {
                let counter = args.long(0).map(|start| Native::object(Counter(AtomicI64::new(start))));
                async move { counter }
            });

        let registry = Arc::new(Registry::new());
        registry.register_entry_point(Arc::new(Calculator::default()));
        let types = Arc::new(types);
        let callbacks = CallbackClient::new(
            CallbackSettings {
                address: None,
                client: ClientOptions::default(),
                auto_release: true,
            },
            registry.clone(),
            types.clone(),
        );
        let scope = Scope::Connection(registry.open_scope());
        (Dispatcher::new(registry, types, callbacks), scope)
    }

    #[tokio::test]
    async fn test_method_call_on_entry_point() {
        let (dispatcher, scope) = dispatcher();
        let response = dispatcher
            .dispatch(
                InvocationRequest::method("0", "add", vec![Value::Integer(2), Value::Integer(3)]),
                scope,
            )
            .await;
        assert_eq!(response, InvocationResponse::Success(Value::Integer(5)));
    }

    #[tokio::test]
    async fn test_returned_object_is_registered_once() {
        let (dispatcher, scope) = dispatcher();
        let response = dispatcher
            .dispatch(InvocationRequest::method("0", "counter", vec![]), scope)
            .await;
        assert_eq!(
            response,
            InvocationResponse::Success(Value::ObjectRef(ObjectId::from("1")))
        );

        for expected in 1..=2 {
            let response = dispatcher
                .dispatch(InvocationRequest::method("1", "increment", vec![]), scope)
                .await;
            assert_eq!(response, InvocationResponse::Success(Value::Integer(expected)));
        }
        assert_eq!(dispatcher.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_failures_become_error_responses() {
        let (dispatcher, scope) = dispatcher();

        let cases = [
            (
                InvocationRequest::method("0", "divide", vec![Value::Integer(1), Value::Integer(0)]),
                "ArithmeticError",
            ),
            (InvocationRequest::method("77", "add", vec![]), "UnknownReferenceError"),
            (InvocationRequest::method("0", "missing", vec![]), "NoSuchMemberError"),
            (InvocationRequest::method("0", "explode", vec![]), PANIC_ERROR_CLASS),
            (
                InvocationRequest::method("0", "add", vec![Value::ObjectRef(ObjectId::from("99"))]),
                "UnknownReferenceError",
            ),
        ];

        for (request, class) in cases {
            match dispatcher.dispatch(request, scope).await {
                InvocationResponse::Error(envelope) => assert_eq!(envelope.error_class_name, class),
                other => panic!("Expected {} error, got {:?}", class, other),
            }
        }
    }

    #[tokio::test]
    async fn test_fields_and_constructors() {
        let (dispatcher, scope) = dispatcher();

        let response = dispatcher
            .dispatch(InvocationRequest::field_set("0", "memory", Value::Integer(12)), scope)
            .await;
        assert_eq!(response, InvocationResponse::Success(Value::Null));
        let response = dispatcher
            .dispatch(InvocationRequest::field_get("0", "memory"), scope)
            .await;
        assert_eq!(response, InvocationResponse::Success(Value::Integer(12)));

        let response = dispatcher
            .dispatch(InvocationRequest::constructor("Counter", vec![Value::Integer(10)]), scope)
            .await;
        let InvocationResponse::Success(Value::ObjectRef(id)) = response else {
            panic!("Expected an object reference, got {:?}", response);
        };
        let response = dispatcher
            .dispatch(InvocationRequest::method(id, "increment", vec![]), scope)
            .await;
        assert_eq!(response, InvocationResponse::Success(Value::Integer(11)));
    }

    #[tokio::test]
    async fn test_panic_reports_location() {
        let (dispatcher, scope) = dispatcher();
        let response = dispatcher
            .dispatch(InvocationRequest::method("0", "explode", vec![]), scope)
            .await;
        let InvocationResponse::Error(envelope) = response else {
            panic!("Expected an error, got {:?}", response);
        };
        assert_eq!(envelope.message, "kaboom");
        let trace = envelope.remote_stack_trace.unwrap();
        assert!(trace.contains("dispatcher.rs"), "trace was {}", trace);
    }

    #[tokio::test]
    async fn test_dropped_dispatch_aborts_the_call() {
        let (dispatcher, scope) = dispatcher();
        let pending = dispatcher.dispatch(
            InvocationRequest::method("0", "slowCounter", vec![Value::Integer(200)]),
            scope,
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(20), pending)
                .await
                .is_err()
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(dispatcher.registry().len(), 1);
    }
}
