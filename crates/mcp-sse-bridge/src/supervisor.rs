//! Child process lifecycle: spawn with piped stdio, graceful stop, liveness.
//!
//! Stop sequence:
//! 1. SIGTERM (Unix only)
//! 2. Wait up to `stop_grace`
//! 3. SIGKILL and reap

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

pub const DEFAULT_STDERR_LOG: &str = "/tmp/mcp-server-stderr.log";
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open stderr log {path}: {source}")]
    StderrLog {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} not captured")]
    Pipes(&'static str),
}

/// How to launch the child.
#[derive(Debug, Clone)]
pub struct ChildConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Layered over the parent's environment.
    pub env: HashMap<String, String>,
    /// Append-only sink for the child's stderr. `None` discards it.
    pub stderr_log: Option<PathBuf>,
    pub stop_grace: Duration,
}

impl ChildConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: HashMap::new(),
            stderr_log: Some(PathBuf::from(DEFAULT_STDERR_LOG)),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stderr_log(mut self, path: Option<PathBuf>) -> Self {
        self.stderr_log = path;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// The child's protocol pipes, handed to the exchange channel.
pub struct ChildPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Lifecycle operations the bridge needs from a child.
///
/// Lets the service be exercised with an in-memory fake instead of a real
/// subprocess.
#[async_trait]
pub trait ChildProcess: Send + Sync {
    /// Non-blocking liveness check.
    fn is_alive(&self) -> bool;

    /// Graceful stop with bounded wait. A no-op once stopped.
    async fn stop(&self);
}

/// Owns the spawned child process.
pub struct ChildSupervisor {
    child: StdMutex<Option<Child>>,
    executable: String,
    stop_grace: Duration,
}

impl ChildSupervisor {
    pub fn start(config: &ChildConfig) -> Result<(Self, ChildPipes), SpawnError> {
        let executable = config.executable.display().to_string();

        let stderr = match &config.stderr_log {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| SpawnError::StderrLog {
                        path: path.display().to_string(),
                        source,
                    })?;
                Stdio::from(file)
            }
            None => Stdio::null(),
        };

        tracing::info!(executable = %executable, args = ?config.args, "Starting child process");

        let mut child = Command::new(&config.executable)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                executable: executable.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SpawnError::Pipes("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::Pipes("stdout"))?;

        match &config.stderr_log {
            Some(path) => tracing::info!(
                pid = child.id(),
                stderr_log = %path.display(),
                "Child process started, stderr redirected"
            ),
            None => tracing::info!(pid = child.id(), "Child process started"),
        }

        let supervisor = Self {
            child: StdMutex::new(Some(child)),
            executable,
            stop_grace: config.stop_grace,
        };
        Ok((supervisor, ChildPipes { stdin, stdout }))
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_child().as_ref().and_then(Child::id)
    }

    fn lock_child(&self) -> std::sync::MutexGuard<'_, Option<Child>> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Child mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }
}

#[async_trait]
impl ChildProcess for ChildSupervisor {
    fn is_alive(&self) -> bool {
        match self.lock_child().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn stop(&self) {
        // Taken out so concurrent and repeated stops find nothing to do.
        let Some(mut child) = self.lock_child().take() else {
            return;
        };

        tracing::info!(executable = %self.executable, "Stopping child process");
        terminate(&mut child);

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(code = ?status.code(), "Child process stopped");
                return;
            }
            Ok(Err(e)) => tracing::error!(error = %e, "Waiting for child failed"),
            Err(_) => tracing::warn!(
                grace_secs = self.stop_grace.as_secs_f64(),
                "Child did not exit within grace period, killing"
            ),
        }

        if let Err(e) = child.kill().await {
            tracing::error!(error = %e, "Failed to kill child process");
            return;
        }
        tracing::info!("Child process killed");
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to terminate child");
    }
}
