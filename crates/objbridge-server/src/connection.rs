//! Primary channel connection worker
//!
//! One worker per accepted connection. It reads a request, answers it, and only
//! then reads the next one. Any I/O error or protocol violation closes the
//! connection, and everything it introduced is pruned from the registry.

use crate::dispatcher::Dispatcher;
use crate::registry::{ConnectionId, Scope};
use objbridge_core::{
    BridgeError, BridgeMessage, ErrorEnvelope, InvocationResponse, Result, Value,
};
use objbridge_wire::{AsyncReader, AsyncWriter};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshake,
    Ready,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Handshake => "HANDSHAKE",
            ConnectionState::Ready => "READY",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// What every worker of a gateway shares
pub struct ConnectionContext {
    pub dispatcher: Dispatcher,
    /// Token the first frame must carry
    pub auth_token: Option<String>,
    /// Whether a `shutdown` frame stops the gateway
    pub allow_remote_shutdown: bool,
    /// Flipped to `true` once shutdown begins
    pub shutdown: watch::Sender<bool>,
}

/// What to do after handling a frame
enum Next {
    Continue,
    Close,
}

/// Serves the primary channel protocol on one transport
pub struct Connection<R, W> {
    id: ConnectionId,
    reader: R,
    writer: W,
    state: ConnectionState,
    context: Arc<ConnectionContext>,
}

impl<R: AsyncReader, W: AsyncWriter> Connection<R, W> {
    pub fn new(reader: R, writer: W, context: Arc<ConnectionContext>) -> Self {
        let id = context.dispatcher.registry().open_scope();
        Self {
            id,
            reader,
            writer,
            state: ConnectionState::Connecting,
            context,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!("{}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }

    /// Serve until the peer leaves, the protocol breaks or shutdown begins
    pub async fn run(mut self) {
        let mut shutdown = self.context.shutdown.subscribe();
        self.transition(ConnectionState::Handshake);

        let outcome = match self.handshake().await {
            Ok(true) => {
                self.transition(ConnectionState::Ready);
                self.serve(&mut shutdown).await
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {}
            Err(BridgeError::ConnectionLost(detail)) => debug!("{}: {}", self.id, detail),
            Err(e) => warn!("{}: closing after {}", self.id, e),
        }
        self.close();
    }

    /// Returns whether the connection may proceed to serve requests
    async fn handshake(&mut self) -> Result<bool> {
        let Some(expected) = self.context.auth_token.clone() else {
            return Ok(true);
        };

        match self.reader.read_frame().await? {
            BridgeMessage::Auth { token } if token == expected => {
                self.reply(InvocationResponse::Success(Value::Null)).await?;
                info!("{}: authenticated", self.id);
                Ok(true)
            }
            other => {
                // Rejected peers get no response
                warn!(
                    "{}: handshake rejected (first frame was {})",
                    self.id,
                    other.kind_label()
                );
                Ok(false)
            }
        }
    }

    async fn serve(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let mut first = self.context.auth_token.is_none();
        loop {
            if *shutdown.borrow() {
                debug!("{}: shutdown begun, no further requests", self.id);
                return Ok(());
            }

            // A frame racing the shutdown flag is left unread
            let msg = tokio::select! {
                biased;
                _ = shutdown.changed() => continue,
                msg = self.reader.read_frame() => msg?,
            };

            // Without a configured token an auth frame may still open the conversation
            if std::mem::take(&mut first) {
                if let BridgeMessage::Auth { .. } = msg {
                    self.reply(InvocationResponse::Success(Value::Null)).await?;
                    continue;
                }
            }

            if let Next::Close = self.handle(msg).await? {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, msg: BridgeMessage) -> Result<Next> {
        match msg {
            BridgeMessage::Call(request) => {
                let response = self
                    .context
                    .dispatcher
                    .dispatch(request, Scope::Connection(self.id))
                    .await;
                self.reply(response).await?;
                Ok(Next::Continue)
            }
            BridgeMessage::Release(id) => {
                self.context.dispatcher.registry().release(&id);
                self.reply(InvocationResponse::Success(Value::Null)).await?;
                Ok(Next::Continue)
            }
            BridgeMessage::Shutdown if self.context.allow_remote_shutdown => {
                info!("{}: peer requested shutdown", self.id);
                self.reply(InvocationResponse::Success(Value::Null)).await?;
                self.context.shutdown.send_replace(true);
                Ok(Next::Close)
            }
            BridgeMessage::Shutdown => {
                let envelope = ErrorEnvelope::new(
                    BridgeError::Shutdown.class_name(),
                    "Remote shutdown is disabled",
                );
                self.reply(InvocationResponse::Error(envelope)).await?;
                Ok(Next::Continue)
            }
            other @ (BridgeMessage::Auth { .. } | BridgeMessage::Response(_)) => {
                Err(BridgeError::ProtocolError(format!(
                    "Unexpected {} frame in state {}",
                    other.kind_label(),
                    self.state
                )))
            }
        }
    }

    async fn reply(&mut self, response: InvocationResponse) -> Result<()> {
        self.writer
            .write_frame(&BridgeMessage::Response(response))
            .await
    }

    fn close(&mut self) {
        self.transition(ConnectionState::Closed);
        let pruned = self.context.dispatcher.registry().close_scope(self.id);
        info!("{} closed ({} objects pruned)", self.id, pruned);
    }
}
