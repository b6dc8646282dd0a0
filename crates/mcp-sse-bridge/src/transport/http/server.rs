//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use crate::service::BridgeService;

use super::routes::{AppState, HEALTH_PATH, MESSAGE_PATH, SSE_PATH, routes};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Interval between SSE keep-alive comments.
    pub keep_alive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8011,
            keep_alive: Duration::from_secs(15),
        }
    }
}

/// Serve the bridge until SIGINT/SIGTERM, then shut the bridge down.
pub async fn serve(config: ServerConfig, service: Arc<BridgeService>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve_with_listener(listener, config, service, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// Once `shutdown` fires the bridge is shut down *before* axum drains
/// connections: open SSE streams would otherwise keep the drain waiting
/// forever.
pub async fn serve_with_listener<F>(
    listener: TcpListener,
    config: ServerConfig,
    service: Arc<BridgeService>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let actual_addr = listener.local_addr()?;
    let app = routes(AppState {
        service: Arc::clone(&service),
        keep_alive: config.keep_alive,
    });

    info!("Starting SSE bridge on http://{}", actual_addr);
    info!("SSE endpoint: http://{}{}", actual_addr, SSE_PATH);
    info!("Message endpoint: http://{}{}", actual_addr, MESSAGE_PATH);
    info!("Health endpoint: http://{}{}", actual_addr, HEALTH_PATH);

    let drain_service = Arc::clone(&service);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            drain_service.shutdown().await;
        })
        .await?;

    // No-op when the graceful path already ran; covers serve errors.
    service.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    use crate::service::BridgeConfig;

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8011);
        assert_eq!(config.keep_alive, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn shutdown_completes_with_open_sse_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = Arc::new(BridgeService::new(BridgeConfig::default()));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(serve_with_listener(
            listener,
            ServerConfig::default(),
            Arc::clone(&service),
            async move {
                let _ = stop_rx.await;
            },
        ));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /sse HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let head = String::from_utf8_lossy(&buf[..n]);
        assert!(head.starts_with("HTTP/1.1 200"));
        assert_eq!(service.subscribers().len(), 1);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not drain")
            .unwrap()
            .unwrap();
        assert!(!service.is_accepting());
        assert!(service.subscribers().is_empty());
    }
}
