//! Wire layer for the object bridge
//!
//! This crate provides:
//! - The frame codec (`encode`/`decode`) for every bridge message
//! - Transport abstractions (AsyncReader/AsyncWriter traits)
//! - Incremental framing over any tokio byte stream
//! - TCP transport

pub mod protocol;
pub mod tcp;
pub mod transport;

pub use protocol::{DEFAULT_MAX_FRAME_BYTES, decode, encode};
pub use transport::{AsyncReader, AsyncWriter, FrameBuffer, FramedReader, FramedWriter};
