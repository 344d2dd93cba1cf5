//! Calling side of a bridge channel
//!
//! `BridgeClient` owns one TCP connection and issues strictly one request at a
//! time, waiting for its response before the next. The remote runtime uses it on
//! the primary channel; the gateway uses it on the callback channel.

use objbridge_core::{
    BridgeError, BridgeMessage, InvocationRequest, InvocationResponse, ObjectId, Result, Value,
};
use objbridge_wire::protocol::DEFAULT_MAX_FRAME_BYTES;
use objbridge_wire::tcp::{self, TcpReadWrapper, TcpWriteWrapper};
use objbridge_wire::{AsyncReader, AsyncWriter};
use std::time::Duration;
use tracing::{debug, warn};

/// Connection options for a client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Token sent in the handshake frame
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
    /// Give up on a response after this long
    pub read_timeout: Option<Duration>,
    pub max_frame_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auth_token: None,
            connect_timeout: Duration::from_secs(5),
            read_timeout: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// One half-duplex request/response connection
pub struct BridgeClient {
    reader: TcpReadWrapper,
    writer: TcpWriteWrapper,
    peer: String,
    /// Set once a transport or protocol failure left the stream out of sync
    broken: bool,
}

impl BridgeClient {
    /// Connect with default options
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with(addr, ClientOptions::default()).await
    }

    /// Connect and, when a token is configured, perform the handshake
    pub async fn connect_with(addr: &str, options: ClientOptions) -> Result<Self> {
        let (reader, writer) =
            tcp::connect(addr, options.connect_timeout, options.max_frame_bytes).await?;

        let mut client = Self {
            reader: reader.with_read_timeout(options.read_timeout),
            writer,
            peer: addr.to_string(),
            broken: false,
        };

        if let Some(token) = options.auth_token {
            // A gateway rejecting the token closes the socket without replying
            match client.request(&BridgeMessage::Auth { token }).await {
                Ok(InvocationResponse::Success(_)) => debug!("Authenticated with {}", addr),
                Ok(InvocationResponse::Error(envelope)) => {
                    warn!("Handshake with {} refused: {}", addr, envelope);
                    return Err(BridgeError::AuthFailed);
                }
                Err(BridgeError::ConnectionLost(_)) => return Err(BridgeError::AuthFailed),
                Err(e) => return Err(e),
            }
        }

        Ok(client)
    }

    /// Address this client is connected to
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the connection can still carry requests
    pub fn is_usable(&self) -> bool {
        !self.broken
    }

    /// Send one frame and wait for its response
    pub async fn request(&mut self, msg: &BridgeMessage) -> Result<InvocationResponse> {
        if self.broken {
            return Err(BridgeError::ConnectionLost(format!(
                "Connection to {} is no longer usable",
                self.peer
            )));
        }

        let result = self.exchange(msg).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                self.broken = true;
            }
        }
        result
    }

    async fn exchange(&mut self, msg: &BridgeMessage) -> Result<InvocationResponse> {
        self.writer.write_frame(msg).await?;

        match self.reader.read_frame().await? {
            BridgeMessage::Response(response) => Ok(response),
            other => Err(BridgeError::ProtocolError(format!(
                "Expected a response to {}, got {}",
                msg.kind_label(),
                other.kind_label()
            ))),
        }
    }

    /// Run an invocation; error responses become `BridgeError::Remote`
    pub async fn invoke(&mut self, request: InvocationRequest) -> Result<Value> {
        self.request(&BridgeMessage::Call(request)).await?.into_result()
    }

    /// Call a method on a serving-side object
    pub async fn call(
        &mut self,
        target: impl Into<ObjectId>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.invoke(InvocationRequest::method(target, method, args)).await
    }

    pub async fn get_field(&mut self, target: impl Into<ObjectId>, field: &str) -> Result<Value> {
        self.invoke(InvocationRequest::field_get(target, field)).await
    }

    pub async fn set_field(
        &mut self,
        target: impl Into<ObjectId>,
        field: &str,
        value: Value,
    ) -> Result<()> {
        self.invoke(InvocationRequest::field_set(target, field, value))
            .await
            .map(|_| ())
    }

    /// Instantiate a registered class on the serving side
    pub async fn construct(&mut self, class_name: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke(InvocationRequest::constructor(class_name, args)).await
    }

    /// Drop one reference to a serving-side object
    pub async fn release(&mut self, id: impl Into<ObjectId>) -> Result<()> {
        self.request(&BridgeMessage::Release(id.into()))
            .await?
            .into_result()
            .map(|_| ())
    }

    /// Ask the serving side to shut down
    pub async fn shutdown_gateway(&mut self) -> Result<()> {
        self.request(&BridgeMessage::Shutdown)
            .await?
            .into_result()
            .map(|_| ())
    }
}
