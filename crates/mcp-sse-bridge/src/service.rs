//! BridgeService: transport-agnostic coordinator between callers, the child
//! process and stream subscribers.
//!
//! This service owns:
//! - The child process handle and its exchange worker (at most one)
//! - The subscriber registry
//! - Intake gating for shutdown
//!
//! Per inbound message:
//! RECEIVED → CLASSIFIED → (NOTIFICATION_ACK | EXCHANGED) → BROADCAST → RETURNED

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::bridge::protocol::ProtocolMessage;
use crate::channel::{ChannelHandle, ExchangeError, ExchangeWorker, LineChannel};
use crate::health::Health;
use crate::subscribers::{DEFAULT_QUEUE_CAPACITY, Subscriber, SubscriberRegistry};
use crate::supervisor::{ChildConfig, ChildProcess, ChildSupervisor, SpawnError};
use crate::version::VersionInfo;

/// What happens to an inbound notification besides the acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NotificationPolicy {
    /// Acknowledge only.
    #[default]
    Drop,
    /// Write to the child; no reply is awaited.
    ForwardToChild,
    /// Broadcast to subscribers.
    Broadcast,
    ForwardAndBroadcast,
}

impl NotificationPolicy {
    fn forwards(self) -> bool {
        matches!(self, Self::ForwardToChild | Self::ForwardAndBroadcast)
    }

    fn broadcasts(self) -> bool {
        matches!(self, Self::Broadcast | Self::ForwardAndBroadcast)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown notification policy '{0}', expected drop, forward, broadcast or forward-and-broadcast")]
pub struct ParsePolicyError(String);

impl FromStr for NotificationPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop" => Ok(Self::Drop),
            "forward" => Ok(Self::ForwardToChild),
            "broadcast" => Ok(Self::Broadcast),
            "forward-and-broadcast" => Ok(Self::ForwardAndBroadcast),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub notifications: NotificationPolicy,
    pub queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            notifications: NotificationPolicy::Drop,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl BridgeConfig {
    pub fn with_notifications(mut self, policy: NotificationPolicy) -> Self {
        self.notifications = policy;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid message: {0}")]
    Protocol(String),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("child process not running")]
    NotRunning,
    #[error("bridge is shutting down")]
    ShuttingDown,
    #[error("a child process is already attached")]
    AlreadyAttached,
}

/// A failed message, paired with its correlation id when one was parsed.
#[derive(Debug)]
pub struct BridgeFailure {
    pub id: Option<Value>,
    pub error: BridgeError,
}

impl BridgeFailure {
    fn new(id: Option<Value>, error: impl Into<BridgeError>) -> Self {
        Self {
            id,
            error: error.into(),
        }
    }

    pub fn envelope(&self) -> ProtocolMessage {
        ProtocolMessage::error_envelope(self.id.clone(), self.error.to_string())
    }
}

/// Successful outcome of one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Child reply; also broadcast to subscribers.
    Reply(ProtocolMessage),
    /// Notification accepted; nothing to return.
    Acknowledged,
}

/// Snapshot of bridge health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: Health,
    pub subscribers: usize,
    pub skipped_lines: u64,
    pub version: VersionInfo,
}

struct Attached {
    child: Arc<dyn ChildProcess>,
    channel: ChannelHandle,
    worker: JoinHandle<()>,
}

/// Transport-agnostic bridge coordinator.
pub struct BridgeService {
    attached: RwLock<Option<Attached>>,
    subscribers: SubscriberRegistry,
    accepting: AtomicBool,
    config: BridgeConfig,
    version: VersionInfo,
}

impl BridgeService {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            attached: RwLock::new(None),
            subscribers: SubscriberRegistry::new(config.queue_capacity),
            accepting: AtomicBool::new(true),
            config,
            version: VersionInfo::new(),
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    /// Spawn the child described by `config` and attach it.
    pub async fn start(&self, config: &ChildConfig) -> Result<(), BridgeError> {
        let mut attached = self.attached.write().await;
        if attached.is_some() {
            return Err(BridgeError::AlreadyAttached);
        }
        let (supervisor, pipes) = ChildSupervisor::start(config)?;
        let channel = LineChannel::new(pipes.stdin, pipes.stdout);
        *attached = Some(spawn_attached(Arc::new(supervisor), channel));
        Ok(())
    }

    /// Attach an already running child and the channel to its pipes.
    pub async fn attach(
        &self,
        child: Arc<dyn ChildProcess>,
        channel: LineChannel,
    ) -> Result<(), BridgeError> {
        let mut attached = self.attached.write().await;
        if attached.is_some() {
            return Err(BridgeError::AlreadyAttached);
        }
        *attached = Some(spawn_attached(child, channel));
        Ok(())
    }

    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }

    /// Register a new stream subscriber.
    pub fn subscribe(&self) -> Result<Subscriber, BridgeError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(BridgeError::ShuttingDown);
        }
        let subscriber = self.subscribers.register();
        // A shutdown that cleared the registry between the check and the
        // insert would miss this subscriber; dropping it unregisters it.
        if !self.accepting.load(Ordering::Acquire) {
            return Err(BridgeError::ShuttingDown);
        }
        Ok(subscriber)
    }

    /// Parse and handle one raw inbound payload.
    pub async fn handle_raw(&self, body: &[u8]) -> Result<Outcome, BridgeFailure> {
        let value: Value = serde_json::from_slice(body).map_err(|e| {
            BridgeFailure::new(None, BridgeError::Protocol(format!("malformed JSON: {e}")))
        })?;
        let message = ProtocolMessage::from_value(value).ok_or_else(|| {
            BridgeFailure::new(
                None,
                BridgeError::Protocol("message must be a JSON object".to_string()),
            )
        })?;
        self.handle_message(message).await
    }

    pub async fn handle_message(&self, message: ProtocolMessage) -> Result<Outcome, BridgeFailure> {
        let id = message.id().cloned();
        if !self.accepting.load(Ordering::Acquire) {
            return Err(BridgeFailure::new(id, BridgeError::ShuttingDown));
        }

        tracing::info!(method = message.method().unwrap_or("unknown"), "Received message");

        if message.is_notification() {
            self.handle_notification(message).await;
            return Ok(Outcome::Acknowledged);
        }

        let channel = self.channel().await;
        let channel = channel.ok_or_else(|| BridgeFailure::new(id.clone(), BridgeError::NotRunning))?;

        let reply = channel
            .exchange(message)
            .await
            .map_err(|e| BridgeFailure::new(id, e))?;

        self.subscribers.broadcast(&reply);
        Ok(Outcome::Reply(reply))
    }

    async fn handle_notification(&self, message: ProtocolMessage) {
        let policy = self.config.notifications;
        tracing::info!(method = ?message.method(), ?policy, "Received notification");

        if policy.broadcasts() {
            self.subscribers.broadcast(&message);
        }
        if policy.forwards() {
            match self.channel().await {
                Some(channel) => {
                    if let Err(e) = channel.notify(message).await {
                        tracing::warn!(error = %e, "Failed to queue notification for child");
                    }
                }
                None => tracing::warn!("Dropping notification: child process not running"),
            }
        }
    }

    async fn channel(&self) -> Option<ChannelHandle> {
        self.attached
            .read()
            .await
            .as_ref()
            .map(|attached| attached.channel.clone())
    }

    /// Child attached and alive. No side effects.
    pub async fn healthy(&self) -> bool {
        match self.attached.read().await.as_ref() {
            Some(attached) => attached.child.is_alive(),
            None => false,
        }
    }

    pub async fn health(&self) -> HealthSnapshot {
        let (alive, skipped_lines) = match self.attached.read().await.as_ref() {
            Some(attached) => (attached.child.is_alive(), attached.channel.skipped_lines()),
            None => (false, 0),
        };
        HealthSnapshot {
            status: Health::from_alive(alive && self.is_accepting()),
            subscribers: self.subscribers.len(),
            skipped_lines,
            version: self.version.clone(),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop intake, stop the child, then release every subscriber.
    ///
    /// In-flight exchanges fail once the child is gone. Safe to call more than
    /// once.
    pub async fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            tracing::info!("Bridge shutting down, intake closed");
        }

        let attached = self.attached.write().await.take();
        if let Some(attached) = attached {
            attached.child.stop().await;
            attached.worker.abort();
        }

        self.subscribers.clear();
    }
}

fn spawn_attached(child: Arc<dyn ChildProcess>, channel: LineChannel) -> Attached {
    let (channel, worker) = ExchangeWorker::spawn(channel);
    Attached {
        child,
        channel,
        worker,
    }
}
