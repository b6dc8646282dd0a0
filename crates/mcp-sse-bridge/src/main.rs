use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mcp_sse_bridge::{
    BridgeConfig, BridgeService, ChildConfig, NotificationPolicy, VersionInfo,
    supervisor::DEFAULT_STDERR_LOG,
    transport::{ServerConfig, serve},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "mcp-sse-bridge")]
#[command(version, about = "Expose a stdio JSON-RPC server over Server-Sent Events")]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1", env = "BRIDGE_HOST")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8011, env = "BRIDGE_PORT")]
    port: u16,

    /// Path to the stdio server binary
    #[arg(long, default_value = "./target/release/smart-diff-mcp", env = "BRIDGE_BINARY")]
    binary: PathBuf,

    /// File the child's stderr is appended to
    #[arg(long, default_value = DEFAULT_STDERR_LOG, env = "BRIDGE_STDERR_LOG")]
    stderr_log: PathBuf,

    /// Discard the child's stderr instead of logging it to a file
    #[arg(long, conflicts_with = "stderr_log")]
    discard_stderr: bool,

    /// Environment override for the child, KEY=VALUE (repeatable). The child
    /// always gets RUST_LOG=debug unless overridden here.
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Seconds to wait after SIGTERM before killing the child
    #[arg(long, default_value_t = 5)]
    stop_grace_secs: u64,

    /// Per-subscriber queue length before the subscriber is disconnected
    #[arg(long, default_value_t = 1024)]
    queue_capacity: usize,

    /// Notification handling: drop, forward, broadcast, forward-and-broadcast
    #[arg(long, default_value = "drop", env = "BRIDGE_NOTIFICATIONS")]
    notifications: NotificationPolicy,

    /// Seconds between SSE keep-alive comments
    #[arg(long, default_value_t = 15)]
    keep_alive_secs: u64,

    #[arg(long, value_enum, default_value = "text", env = "LOG_FORMAT")]
    log_format: LogFormat,

    /// Arguments passed to the child after `--`
    #[arg(last = true)]
    child_args: Vec<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// Initialize tracing with RUST_LOG and LOG_FORMAT support.
fn init_tracing(format: LogFormat) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("mcp_sse_bridge=info,mcp_sse_bridge::bridge::codec=off")
    };

    match format {
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr));
            let _ = subscriber.try_init();
        }
        LogFormat::Text => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr));
            let _ = subscriber.try_init();
        }
    }
}

impl Args {
    fn child_config(&self) -> ChildConfig {
        let stderr_log = (!self.discard_stderr).then(|| self.stderr_log.clone());
        self.env.iter().fold(
            ChildConfig::new(&self.binary)
                .with_env("RUST_LOG", "debug")
                .with_args(self.child_args.iter().cloned())
                .with_stderr_log(stderr_log)
                .with_stop_grace(Duration::from_secs(self.stop_grace_secs)),
            |config, (key, value)| config.with_env(key.clone(), value.clone()),
        )
    }

    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig::default()
            .with_notifications(self.notifications)
            .with_queue_capacity(self.queue_capacity)
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            keep_alive: Duration::from_secs(self.keep_alive_secs),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("mcp-sse-bridge {}", env!("CARGO_PKG_VERSION"));

    let version = VersionInfo::new().with_child(args.binary.display().to_string());
    let service = Arc::new(BridgeService::new(args.bridge_config()).with_version(version));

    if let Err(e) = service.start(&args.child_config()).await {
        error!(error = %e, "Failed to start child process");
        return ExitCode::FAILURE;
    }

    match serve(args.server_config(), service).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let args = Args::try_parse_from(["mcp-sse-bridge"]).unwrap();
        assert_eq!(args.host, "127.0.0.1");
        assert_eq!(args.port, 8011);
        assert_eq!(args.notifications, NotificationPolicy::Drop);

        let child = args.child_config();
        assert_eq!(child.env.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert_eq!(child.stderr_log, Some(PathBuf::from(DEFAULT_STDERR_LOG)));
        assert_eq!(child.stop_grace, Duration::from_secs(5));
    }

    #[test]
    fn child_args_and_env_are_collected() {
        let args = Args::try_parse_from([
            "mcp-sse-bridge",
            "--binary",
            "/usr/bin/server",
            "--env",
            "A=1",
            "--env",
            "B=x=y",
            "--discard-stderr",
            "--notifications",
            "forward",
            "--",
            "--stdio",
            "-v",
        ])
        .unwrap();

        let child = args.child_config();
        assert_eq!(child.executable, PathBuf::from("/usr/bin/server"));
        assert_eq!(child.args, vec!["--stdio", "-v"]);
        assert_eq!(child.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(child.env.get("B").map(String::as_str), Some("x=y"));
        assert_eq!(child.env.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert!(child.stderr_log.is_none());
        assert_eq!(args.notifications, NotificationPolicy::ForwardToChild);
    }

    #[test]
    fn explicit_rust_log_replaces_base_value() {
        let args =
            Args::try_parse_from(["mcp-sse-bridge", "--env", "RUST_LOG=info"]).unwrap();

        let child = args.child_config();
        assert_eq!(child.env.get("RUST_LOG").map(String::as_str), Some("info"));
        assert_eq!(child.env.len(), 1);
    }

    #[test]
    fn env_pair_requires_key() {
        assert!(parse_env_pair("=value").is_err());
        assert!(parse_env_pair("novalue").is_err());
        assert_eq!(
            parse_env_pair("K=").unwrap(),
            ("K".to_string(), String::new())
        );
    }
}
