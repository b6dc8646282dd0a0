//! Line protocol spoken with the child process.
//!
//! # Architecture
//!
//! - **protocol**: `ProtocolMessage` shape, line `encode`/`decode`, error envelope
//! - **codec**: newline framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
