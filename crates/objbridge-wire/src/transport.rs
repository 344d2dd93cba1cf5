//! Transport abstractions for bridge channels
//!
//! Provides AsyncReader/AsyncWriter traits plus framed implementations over any
//! tokio byte stream. Frames are terminator-delimited, so a frame split across
//! several reads is reassembled by [`FrameBuffer`].

use crate::protocol::{TERMINATOR, decode, encode};
use async_trait::async_trait;
use objbridge_core::{BridgeError, BridgeMessage, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const READ_CHUNK: usize = 8 * 1024;

/// Trait for async reading from a transport
#[async_trait]
pub trait AsyncReader: Send {
    /// Read one complete frame, terminator included
    async fn read_message(&mut self) -> Result<Vec<u8>>;

    /// Read and decode one frame
    async fn read_frame(&mut self) -> Result<BridgeMessage> {
        let data = self.read_message().await?;
        debug!("[peer→local] {}", preview(&data));
        decode(&data)
    }
}

/// Trait for async writing to a transport
#[async_trait]
pub trait AsyncWriter: Send {
    /// Write one complete frame
    async fn write_message(&mut self, data: &[u8]) -> Result<()>;

    /// Encode and write one frame
    async fn write_frame(&mut self, msg: &BridgeMessage) -> Result<()> {
        let data = encode(msg);
        debug!("[local→peer] {}", preview(&data));
        self.write_message(&data).await
    }
}

/// Frame preview for logs, newlines made visible
pub fn preview(data: &[u8]) -> String {
    let text: String = String::from_utf8_lossy(data).chars().take(200).collect();
    format!("len={} frame={}", data.len(), text.replace('\n', "⏎"))
}

/// Accumulates raw bytes and splits them into complete frames
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    /// Start of the first line not yet checked for the terminator
    line_start: usize,
    max_frame_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            line_start: 0,
            max_frame_bytes,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as a frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one has fully arrived
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let Some(offset) = self.buf[self.line_start..].iter().position(|&b| b == b'\n') else {
                if self.buf.len() > self.max_frame_bytes {
                    return Err(BridgeError::ProtocolError(format!(
                        "Message too large: {} bytes without terminator",
                        self.buf.len()
                    )));
                }
                return Ok(None);
            };

            let newline = self.line_start + offset;
            let line = &self.buf[self.line_start..newline];
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if line == TERMINATOR.as_bytes() {
                let frame: Vec<u8> = self.buf.drain(..=newline).collect();
                self.line_start = 0;
                if frame.len() > self.max_frame_bytes {
                    return Err(BridgeError::ProtocolError(format!(
                        "Message too large: {} bytes",
                        frame.len()
                    )));
                }
                return Ok(Some(frame));
            }

            self.line_start = newline + 1;
        }
    }
}

/// Framed reader over any byte stream
pub struct FramedReader<R> {
    inner: R,
    frames: FrameBuffer,
    read_timeout: Option<Duration>,
}

impl<R> FramedReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            frames: FrameBuffer::new(max_frame_bytes),
            read_timeout: None,
        }
    }

    /// Fail reads that see no data for `timeout`
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

#[async_trait]
impl<R> AsyncReader for FramedReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_message(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.frames.next_frame()? {
                return Ok(frame);
            }

            let read = self.inner.read(&mut chunk);
            let n = match self.read_timeout {
                Some(timeout) => tokio::time::timeout(timeout, read)
                    .await
                    .map_err(|_| BridgeError::Timeout(format!("No data within {:?}", timeout)))?,
                None => read.await,
            }
            .map_err(|e| BridgeError::ConnectionLost(format!("Read failed: {}", e)))?;

            if n == 0 {
                let detail = if self.frames.pending() > 0 {
                    "Peer closed connection mid-frame"
                } else {
                    "Peer closed connection"
                };
                return Err(BridgeError::ConnectionLost(detail.into()));
            }
            self.frames.extend(&chunk[..n]);
        }
    }
}

/// Framed writer over any byte stream
pub struct FramedWriter<W>(pub W);

#[async_trait]
impl<W> AsyncWriter for FramedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_message(&mut self, data: &[u8]) -> Result<()> {
        self.0
            .write_all(data)
            .await
            .map_err(|e| BridgeError::ConnectionLost(format!("Write failed: {}", e)))?;

        // Flush to ensure data is sent
        self.0
            .flush()
            .await
            .map_err(|e| BridgeError::ConnectionLost(format!("Flush failed: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_FRAME_BYTES;
    use objbridge_core::{InvocationResponse, ObjectId, Value};
    use tokio_test::io::Builder;

    #[test]
    fn test_frame_buffer_resumes_partial_input() {
        let mut frames = FrameBuffer::new(DEFAULT_MAX_FRAME_BYTES);
        frames.extend(b"r\ni");
        assert!(frames.next_frame().unwrap().is_none());
        frames.extend(b"5\n.");
        assert!(frames.next_frame().unwrap().is_none());
        frames.extend(b"\ng\n3\n.\n");
        assert_eq!(frames.next_frame().unwrap().unwrap(), b"r\ni5\n.\n");
        assert_eq!(frames.next_frame().unwrap().unwrap(), b"g\n3\n.\n");
        assert!(frames.next_frame().unwrap().is_none());
        assert_eq!(frames.pending(), 0);
    }

    #[test]
    fn test_frame_buffer_ignores_dot_inside_tokens() {
        let mut frames = FrameBuffer::new(DEFAULT_MAX_FRAME_BYTES);
        frames.extend(b"r\ns.\n.\n");
        assert_eq!(frames.next_frame().unwrap().unwrap(), b"r\ns.\n.\n");
    }

    #[test]
    fn test_frame_buffer_limit() {
        let mut frames = FrameBuffer::new(8);
        frames.extend(b"r\nsaaaaaaaaaaaa");
        assert!(matches!(
            frames.next_frame(),
            Err(BridgeError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_reassembles_split_frames() {
        let mock = Builder::new().read(b"r\ni").read(b"42\n").read(b".\n").build();
        let mut reader = FramedReader::new(mock, DEFAULT_MAX_FRAME_BYTES);
        let msg = reader.read_frame().await.unwrap();
        assert_eq!(
            msg,
            BridgeMessage::Response(InvocationResponse::Success(Value::Integer(42)))
        );
    }

    #[tokio::test]
    async fn test_reader_reports_eof_as_connection_lost() {
        let mock = Builder::new().read(b"r\ni1\n").build();
        let mut reader = FramedReader::new(mock, DEFAULT_MAX_FRAME_BYTES);
        match reader.read_frame().await {
            Err(BridgeError::ConnectionLost(detail)) => assert!(detail.contains("mid-frame")),
            other => panic!("Expected connection lost, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_timeout_fires_on_stalled_peer() {
        let mock = Builder::new()
            .read(b"r\n")
            .wait(Duration::from_millis(500))
            .build();
        let mut reader = FramedReader::new(mock, DEFAULT_MAX_FRAME_BYTES)
            .with_read_timeout(Some(Duration::from_millis(50)));
        match reader.read_frame().await {
            Err(BridgeError::Timeout(_)) => {}
            other => panic!("Expected a timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_writer_emits_encoded_frame() {
        let mock = Builder::new().write(b"g\n7\n.\n").build();
        let mut writer = FramedWriter(mock);
        writer
            .write_frame(&BridgeMessage::Release(ObjectId::from("7")))
            .await
            .unwrap();
    }
}
