//! HTTP transport: `/sse` stream, `/message` submission, `/health` check.

pub mod routes;
pub mod server;

pub use routes::{AppState, HEALTH_PATH, MESSAGE_PATH, SSE_PATH, routes};
pub use server::{ServerConfig, serve, serve_with_listener};
