//! mcp-sse-bridge: expose a stdio JSON-RPC child process over Server-Sent Events.

mod health;
mod version;

pub mod bridge;
pub mod channel;
pub mod service;
pub mod subscribers;
pub mod supervisor;
pub mod transport;

pub use bridge::protocol::{Decoded, MessageKind, ProtocolMessage};
pub use channel::{ChannelHandle, ExchangeError, ExchangeWorker, LineChannel};
pub use health::Health;
pub use service::{
    BridgeConfig, BridgeError, BridgeFailure, BridgeService, HealthSnapshot, NotificationPolicy,
    Outcome,
};
pub use subscribers::{BroadcastReport, DeliveryError, Subscriber, SubscriberId, SubscriberRegistry};
pub use supervisor::{ChildConfig, ChildPipes, ChildProcess, ChildSupervisor, SpawnError};
pub use version::{BRIDGE_VERSION, VersionInfo};
