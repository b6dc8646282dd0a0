//! Transport layer for the bridge.
//!
//! Currently provides the HTTP + Server-Sent Events transport via axum.

pub mod http;

pub use http::{ServerConfig, serve};
