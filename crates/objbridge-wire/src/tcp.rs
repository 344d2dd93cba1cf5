//! TCP transport for bridge channels
//!
//! Both channels run over loopback TCP: the primary channel is accepted by the
//! gateway, the callback channel is dialed by it.

use crate::transport::{FramedReader, FramedWriter};
use objbridge_core::{BridgeError, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

/// TCP read wrapper
pub type TcpReadWrapper = FramedReader<OwnedReadHalf>;

/// TCP write wrapper
pub type TcpWriteWrapper = FramedWriter<OwnedWriteHalf>;

/// Split a connected stream into framed halves
pub fn split(stream: TcpStream, max_frame_bytes: usize) -> Result<(TcpReadWrapper, TcpWriteWrapper)> {
    // Disable Nagle's algorithm for low latency
    stream
        .set_nodelay(true)
        .map_err(|e| BridgeError::ConnectionLost(format!("Failed to set TCP_NODELAY: {}", e)))?;

    let (read_half, write_half) = stream.into_split();
    Ok((
        FramedReader::new(read_half, max_frame_bytes),
        FramedWriter(write_half),
    ))
}

/// Connect to `addr` within `connect_timeout`
pub async fn connect(
    addr: &str,
    connect_timeout: Duration,
    max_frame_bytes: usize,
) -> Result<(TcpReadWrapper, TcpWriteWrapper)> {
    debug!("Connecting to {}", addr);

    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| BridgeError::Timeout(format!("Connection timeout to {}", addr)))?
        .map_err(|e| BridgeError::ConnectionLost(format!("Failed to connect to {}: {}", addr, e)))?;

    split(stream, max_frame_bytes)
}
