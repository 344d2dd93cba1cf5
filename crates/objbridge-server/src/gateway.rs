//! Gateway: listener, entry point and shutdown orchestration

use crate::callback::CallbackClient;
use crate::config::GatewayConfig;
use crate::connection::{Connection, ConnectionContext};
use crate::dispatcher::Dispatcher;
use crate::invokable::TypeTable;
use crate::registry::{ObjectHandle, Registry};
use objbridge_core::{BridgeError, Result};
use objbridge_wire::tcp;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

struct GatewayInner {
    config: GatewayConfig,
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    callbacks: Arc<CallbackClient>,
    context: Arc<ConnectionContext>,
    stopped: watch::Receiver<bool>,
}

/// A running bridge endpoint
///
/// Cloning yields another handle to the same gateway.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// Bind the primary listener, register `entry_point` as `"0"` and start accepting
    pub async fn start(
        config: GatewayConfig,
        types: TypeTable,
        entry_point: ObjectHandle,
    ) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(&config.address).await.map_err(|e| {
            BridgeError::Config(format!("Failed to bind {}: {}", config.address, e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BridgeError::Config(format!("Failed to read bound address: {}", e)))?;

        let registry = Arc::new(Registry::new());
        registry.register_entry_point(entry_point);

        let types = Arc::new(types);
        let callbacks = CallbackClient::new(config.callback_settings(), registry.clone(), types.clone());
        let (shutdown, _) = watch::channel(false);
        let context = Arc::new(ConnectionContext {
            dispatcher: Dispatcher::new(registry.clone(), types, callbacks.clone()),
            auth_token: config.auth_token.clone(),
            allow_remote_shutdown: config.allow_remote_shutdown,
            shutdown,
        });
        let (stopped_tx, stopped) = watch::channel(false);

        tokio::spawn(accept_loop(
            listener,
            context.clone(),
            AcceptSettings {
                max_frame_bytes: config.max_frame_bytes,
                grace: config.shutdown_grace(),
            },
            callbacks.clone(),
            registry.clone(),
            stopped_tx,
        ));

        info!("Gateway listening on {}", local_addr);
        match &config.callback_address {
            Some(addr) => info!("Callbacks go to {}", addr),
            None => info!("Callbacks disabled"),
        }

        Ok(Self {
            inner: Arc::new(GatewayInner {
                config,
                local_addr,
                registry,
                callbacks,
                context,
                stopped,
            }),
        })
    }

    /// Address the primary listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Channel for invoking objects the peer passed in
    pub fn callbacks(&self) -> &Arc<CallbackClient> {
        &self.inner.callbacks
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.context.shutdown.borrow()
    }

    /// Stop accepting, let in-flight calls finish within the grace period, then
    /// close every connection and clear the registry
    ///
    /// Calling it again, or after a remote shutdown, only waits for completion.
    pub async fn shutdown(&self) {
        if !self.inner.context.shutdown.send_replace(true) {
            info!("Gateway shutdown requested");
        }
        self.wait().await;
    }

    /// Resolve once shutdown has completed
    pub async fn wait(&self) {
        let mut stopped = self.inner.stopped.clone();
        let _ = stopped.wait_for(|done| *done).await;
    }
}

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// Persistent failures such as fd exhaustion would otherwise spin the loop
async fn accept_failed(e: &std::io::Error) {
    error!("Accept error: {}", e);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

struct AcceptSettings {
    max_frame_bytes: usize,
    grace: Duration,
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    settings: AcceptSettings,
    callbacks: Arc<CallbackClient>,
    registry: Arc<Registry>,
    stopped: watch::Sender<bool>,
) {
    let mut shutdown = context.shutdown.subscribe();
    let mut workers = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => match tcp::split(stream, settings.max_frame_bytes) {
                    Ok((reader, writer)) => {
                        let connection = Connection::new(reader, writer, context.clone());
                        info!("Accepted {} as {}", peer, connection.id());
                        workers.spawn(connection.run());
                    }
                    Err(e) => warn!("Dropping connection from {}: {}", peer, e),
                },
                Err(e) => accept_failed(&e).await,
            },
            _ = shutdown.changed() => {}
            Some(_) = workers.join_next(), if !workers.is_empty() => {}
        }
    }

    drop(listener);
    info!("Gateway stopping with {} open connections", workers.len());

    let drained = tokio::time::timeout(settings.grace, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "Aborting {} connections still busy after {:?}",
            workers.len(),
            settings.grace
        );
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }

    callbacks.close().await;
    registry.clear();
    stopped.send_replace(true);
    info!("Gateway stopped");
}
