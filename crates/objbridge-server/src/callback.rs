//! Callback channel
//!
//! Invokes objects owned by the peer. Each call takes a connection of its own
//! from a pool, so concurrent callbacks never share a half-duplex connection
//! and the primary channel stays free while one is in flight.

use crate::invokable::{Native, TypeTable};
use crate::marshal::{Marshaller, Role};
use crate::registry::{ConnectionId, Registry, Scope};
use objbridge_client::{BridgeClient, ClientOptions};
use objbridge_core::{BridgeError, BridgeMessage, InvocationRequest, ObjectId, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How long releases stop dialing after the listener refused a connection
const RELEASE_BACKOFF: Duration = Duration::from_secs(5);

/// Settings for the callback channel
#[derive(Debug, Clone)]
pub struct CallbackSettings {
    /// Where the peer listens for callbacks; `None` disables them
    pub address: Option<String>,
    pub client: ClientOptions,
    /// Send a release when the last clone of a proxy is dropped
    pub auto_release: bool,
}

struct CallbackConnection {
    client: BridgeClient,
    /// Scope of local objects passed out over this connection
    scope: ConnectionId,
}

/// Pool of connections to the peer's callback listener
pub struct CallbackClient {
    settings: CallbackSettings,
    registry: Arc<Registry>,
    types: Arc<TypeTable>,
    idle: Mutex<Vec<CallbackConnection>>,
    /// When dialing the listener last failed
    dial_failed_at: Mutex<Option<Instant>>,
    closed: AtomicBool,
    this: Weak<CallbackClient>,
}

impl CallbackClient {
    pub fn new(
        settings: CallbackSettings,
        registry: Arc<Registry>,
        types: Arc<TypeTable>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            settings,
            registry,
            types,
            idle: Mutex::new(Vec::new()),
            dial_failed_at: Mutex::new(None),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.address.is_some()
    }

    pub fn auto_release(&self) -> bool {
        self.settings.auto_release
    }

    /// Connections currently parked in the pool
    pub async fn idle_connections(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Whether dialing failed within the release backoff window
    async fn dial_failed_recently(&self) -> bool {
        self.dial_failed_at
            .lock()
            .await
            .is_some_and(|at| at.elapsed() < RELEASE_BACKOFF)
    }

    /// Take an idle connection, dialing a new one only when `may_dial` is set
    async fn checkout(&self, may_dial: bool) -> Result<CallbackConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Shutdown);
        }
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }

        let addr = self.settings.address.as_deref().ok_or_else(|| {
            BridgeError::Config("No callback address configured".into())
        })?;
        if !may_dial {
            return Err(BridgeError::ConnectionLost(format!(
                "Callback listener {} was unreachable",
                addr
            )));
        }
        let client = match BridgeClient::connect_with(addr, self.settings.client.clone()).await {
            Ok(client) => {
                *self.dial_failed_at.lock().await = None;
                client
            }
            Err(e) => {
                *self.dial_failed_at.lock().await = Some(Instant::now());
                return Err(e);
            }
        };
        let scope = self.registry.open_scope();
        info!("Opened callback connection {} to {}", scope, addr);
        Ok(CallbackConnection { client, scope })
    }

    async fn checkin(&self, conn: CallbackConnection) {
        if self.closed.load(Ordering::SeqCst) || !conn.client.is_usable() {
            self.discard(conn);
            return;
        }
        self.idle.lock().await.push(conn);
    }

    fn discard(&self, conn: CallbackConnection) {
        let pruned = self.registry.close_scope(conn.scope);
        debug!(
            "Closed callback connection {} ({} objects pruned)",
            conn.scope, pruned
        );
    }

    /// Call `method` on the peer's object `target`
    pub async fn call(&self, target: &ObjectId, method: &str, args: Vec<Native>) -> Result<Native> {
        let mut conn = self.checkout(true).await?;
        let marshal = Marshaller::new(
            &self.registry,
            &self.types,
            self.this.clone(),
            Scope::Connection(conn.scope),
            Role::Calling,
        );

        let args = match marshal.to_values(args) {
            Ok(args) => args,
            Err(e) => {
                self.checkin(conn).await;
                return Err(e);
            }
        };

        debug!("Callback {}.{} on {}", target, method, conn.scope);
        let request = InvocationRequest::method(target.clone(), method, args);
        let response = conn.client.request(&BridgeMessage::Call(request)).await;
        let result = response.and_then(|r| r.into_result()).and_then(|v| marshal.to_native(v));

        if let Err(e) = &result {
            if e.is_fatal() {
                warn!("Callback connection {} failed: {}", conn.scope, e);
            }
        }
        self.checkin(conn).await;
        result
    }

    /// Drop one reference to the peer's object `id`; failures are only logged
    ///
    /// Shortly after the listener refused a connection, releases only use
    /// pooled connections instead of dialing again.
    pub async fn release(&self, id: &ObjectId) {
        if !self.is_enabled() {
            return;
        }
        let may_dial = !self.dial_failed_recently().await;
        let mut conn = match self.checkout(may_dial).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Skipping release of {}: {}", id, e);
                return;
            }
        };
        match conn.client.release(id.clone()).await {
            Ok(()) => debug!("Released remote object {}", id),
            Err(e) => debug!("Release of remote object {} failed: {}", id, e),
        }
        self.checkin(conn).await;
    }

    /// Stop handing out connections and close the idle ones
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<CallbackConnection> = self.idle.lock().await.drain(..).collect();
        let count = drained.len();
        for conn in drained {
            self.discard(conn);
        }
        if count > 0 {
            info!("Closed {} idle callback connections", count);
        }
    }
}

struct ProxyInner {
    id: ObjectId,
    capabilities: Vec<String>,
    callbacks: Weak<CallbackClient>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        let Some(callbacks) = self.callbacks.upgrade() else {
            return;
        };
        if !callbacks.auto_release() {
            return;
        }
        // Outside a runtime there is nothing to send the release with
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let id = std::mem::replace(&mut self.id, ObjectId::new(""));
        runtime.spawn(async move {
            callbacks.release(&id).await;
        });
    }
}

/// Local stand-in for an object owned by the peer
///
/// Holds only the id, the method names the peer declared and a weak link to
/// the callback channel that can reach it.
#[derive(Clone)]
pub struct ProxyHandle {
    inner: Arc<ProxyInner>,
}

impl ProxyHandle {
    pub fn new(id: ObjectId, capabilities: Vec<String>, callbacks: Weak<CallbackClient>) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                id,
                capabilities,
                callbacks,
            }),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.inner.id
    }

    /// Method names the peer declared; empty when it declared none
    pub fn capabilities(&self) -> &[String] {
        &self.inner.capabilities
    }

    pub fn declares(&self, method: &str) -> bool {
        self.inner.capabilities.is_empty() || self.inner.capabilities.iter().any(|c| c == method)
    }

    /// Invoke a method on the peer's object over the callback channel
    pub async fn invoke(&self, method: &str, args: Vec<Native>) -> Result<Native> {
        if !self.declares(method) {
            return Err(BridgeError::NoSuchMember(format!(
                "{} on proxy {} (declares {})",
                method,
                self.inner.id,
                self.inner.capabilities.join(", ")
            )));
        }
        let callbacks = self.inner.callbacks.upgrade().ok_or(BridgeError::Shutdown)?;
        callbacks.call(&self.inner.id, method, args).await
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("id", &self.inner.id)
            .field("capabilities", &self.inner.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objbridge_core::{InvocationResponse, Value};
    use objbridge_wire::tcp::split;
    use objbridge_wire::{AsyncReader, AsyncWriter, DEFAULT_MAX_FRAME_BYTES};
    use tokio::net::TcpListener;

    fn settings(address: Option<String>) -> CallbackSettings {
        CallbackSettings {
            address,
            client: ClientOptions::default(),
            auto_release: true,
        }
    }

    fn client(address: Option<String>) -> Arc<CallbackClient> {
        CallbackClient::new(
            settings(address),
            Arc::new(Registry::new()),
            Arc::new(TypeTable::new()),
        )
    }

    /// Peer that doubles the first integer argument of every call and
    /// reports every frame it saw
    async fn doubling_peer() -> (String, tokio::sync::mpsc::UnboundedReceiver<BridgeMessage>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let (mut reader, mut writer) = split(stream, DEFAULT_MAX_FRAME_BYTES).unwrap();
                    while let Ok(msg) = reader.read_frame().await {
                        let value = match &msg {
                            BridgeMessage::Call(request) => {
                                Value::Integer(request.args[0].as_i64().unwrap_or(0) * 2)
                            }
                            _ => Value::Null,
                        };
                        let _ = tx.send(msg);
                        let reply = BridgeMessage::Response(InvocationResponse::Success(value));
                        if writer.write_frame(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn test_proxy_invoke_reuses_pooled_connection() {
        let (addr, mut seen) = doubling_peer().await;
        let callbacks = client(Some(addr));
        let proxy = ProxyHandle::new(
            ObjectId::from("5"),
            vec!["invoke".into()],
            Arc::downgrade(&callbacks),
        );

        let result = proxy.invoke("invoke", vec![Native::Int(21)]).await.unwrap();
        assert_eq!(result.as_i64(), Some(42));
        let result = proxy.invoke("invoke", vec![Native::Int(4)]).await.unwrap();
        assert_eq!(result.as_i64(), Some(8));
        assert_eq!(callbacks.idle_connections().await, 1);

        match seen.recv().await.unwrap() {
            BridgeMessage::Call(request) => {
                assert_eq!(request.target.as_str(), "5");
                assert_eq!(request.member, "invoke");
            }
            other => panic!("Unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undeclared_method_is_rejected_locally() {
        let callbacks = client(None);
        let proxy = ProxyHandle::new(
            ObjectId::from("5"),
            vec!["invoke".into()],
            Arc::downgrade(&callbacks),
        );
        assert!(matches!(
            proxy.invoke("other", vec![]).await,
            Err(BridgeError::NoSuchMember(_))
        ));
        // Capabilities are known, but no channel exists to use them
        assert!(matches!(
            proxy.invoke("invoke", vec![]).await,
            Err(BridgeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_dropping_last_clone_sends_release() {
        let (addr, mut seen) = doubling_peer().await;
        let callbacks = client(Some(addr));
        let proxy = ProxyHandle::new(ObjectId::from("11"), vec![], Arc::downgrade(&callbacks));
        let clone = proxy.clone();
        drop(proxy);
        drop(clone);

        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, BridgeMessage::Release(ObjectId::from("11")));
    }

    #[tokio::test]
    async fn test_closed_client_refuses_calls() {
        let (addr, _seen) = doubling_peer().await;
        let callbacks = client(Some(addr));
        callbacks.close().await;
        assert!(matches!(
            callbacks.call(&ObjectId::from("1"), "invoke", vec![]).await,
            Err(BridgeError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_and_is_discarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, _writer) = split(stream, DEFAULT_MAX_FRAME_BYTES).unwrap();
            // Read the call and never answer
            let _ = reader.read_frame().await;
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        });

        let callbacks = CallbackClient::new(
            CallbackSettings {
                address: Some(addr),
                client: ClientOptions {
                    read_timeout: Some(std::time::Duration::from_millis(100)),
                    ..Default::default()
                },
                auto_release: false,
            },
            Arc::new(Registry::new()),
            Arc::new(TypeTable::new()),
        );

        let err = callbacks
            .call(&ObjectId::from("3"), "invoke", vec![Native::Int(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert_eq!(err.class_name(), "TimeoutError");
        assert_eq!(callbacks.idle_connections().await, 0);
    }

    #[tokio::test]
    async fn test_release_does_not_redial_after_refused_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let callbacks = client(Some(addr.to_string()));
        assert!(matches!(
            callbacks.call(&ObjectId::from("1"), "invoke", vec![]).await,
            Err(BridgeError::ConnectionLost(_))
        ));

        // The listener comes up, but releases stay within the backoff window
        let listener = TcpListener::bind(addr).await.unwrap();
        callbacks.release(&ObjectId::from("1")).await;
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(200), listener.accept())
                .await
                .is_err()
        );
    }
}
