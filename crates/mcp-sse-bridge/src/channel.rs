//! Request/response exchange with the child over its stdin/stdout.
//!
//! A write is paired with the *next* protocol line read from stdout, so two
//! overlapping exchanges could pair a reply with the wrong request. The
//! [`LineChannel`] is therefore owned by a single [`ExchangeWorker`] task that
//! services one command at a time; callers talk to it through a cloneable
//! [`ChannelHandle`].
//!
//! Running the exchange on the worker also means a caller that goes away
//! mid-exchange (HTTP client disconnect) cannot leave an unread reply behind
//! on the pipe.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::LineCodec;
use crate::bridge::protocol::{Decoded, ProtocolMessage};

const COMMAND_QUEUE: usize = 64;
const LOG_PREVIEW_CHARS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("child process closed its output stream")]
    ChildClosed,
    #[error("child pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("exchange channel closed")]
    Closed,
    #[error("child pipe unusable after an earlier I/O error")]
    Poisoned,
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write-then-read access to the child's pipe pair.
///
/// `exchange` takes `&mut self`: exclusive access for the whole round trip is
/// enforced by the borrow checker.
///
/// After an I/O error the read position relative to outstanding replies is
/// unknown, so the channel is poisoned and every later call fails.
pub struct LineChannel {
    writer: FramedWrite<BoxWriter, LineCodec>,
    reader: FramedRead<BoxReader, LineCodec>,
    skipped: Arc<AtomicU64>,
    poisoned: bool,
}

impl LineChannel {
    pub fn new<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let writer: BoxWriter = Box::new(writer);
        let reader: BoxReader = Box::new(reader);
        Self {
            writer: FramedWrite::new(writer, LineCodec::new()),
            reader: FramedRead::new(reader, LineCodec::new()),
            skipped: Arc::new(AtomicU64::new(0)),
            poisoned: false,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn check<T>(&mut self, result: Result<T, ExchangeError>) -> Result<T, ExchangeError> {
        if let Err(ExchangeError::Io(e)) = &result {
            tracing::error!(error = %e, "Child pipe failed, refusing further exchanges");
            self.poisoned = true;
        }
        result
    }

    /// Counter of non-protocol lines discarded while waiting for replies.
    pub fn skipped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.skipped)
    }

    /// Send `message` and return the next protocol message the child emits.
    pub async fn exchange(
        &mut self,
        message: &ProtocolMessage,
    ) -> Result<ProtocolMessage, ExchangeError> {
        if self.poisoned {
            return Err(ExchangeError::Poisoned);
        }
        let result = self.round_trip(message).await;
        self.check(result)
    }

    async fn round_trip(
        &mut self,
        message: &ProtocolMessage,
    ) -> Result<ProtocolMessage, ExchangeError> {
        tracing::debug!(method = ?message.method(), id = ?message.id(), "Sending to child");
        self.writer.send(message.clone()).await?;

        while let Some(frame) = self.reader.next().await {
            match frame? {
                Decoded::Message(reply) => {
                    tracing::debug!(id = ?reply.id(), "Received from child");
                    return Ok(reply);
                }
                Decoded::NotProtocol(line) if line.is_empty() => {}
                Decoded::NotProtocol(line) => {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    let preview: String = line.chars().take(LOG_PREVIEW_CHARS).collect();
                    tracing::debug!(line = %preview, "Skipping non-protocol line");
                }
            }
        }

        Err(ExchangeError::ChildClosed)
    }

    /// Write `message` without waiting for a reply.
    pub async fn notify(&mut self, message: &ProtocolMessage) -> Result<(), ExchangeError> {
        if self.poisoned {
            return Err(ExchangeError::Poisoned);
        }
        tracing::debug!(method = ?message.method(), "Forwarding notification to child");
        let result = self.writer.send(message.clone()).await.map_err(ExchangeError::from);
        self.check(result)
    }
}

enum Command {
    Exchange {
        message: ProtocolMessage,
        reply: oneshot::Sender<Result<ProtocolMessage, ExchangeError>>,
    },
    Notify {
        message: ProtocolMessage,
    },
}

/// Task that owns the [`LineChannel`] and runs commands strictly in order.
pub struct ExchangeWorker {
    channel: LineChannel,
    commands: mpsc::Receiver<Command>,
}

impl ExchangeWorker {
    /// Spawn the worker on the current runtime and return its handle.
    pub fn spawn(channel: LineChannel) -> (ChannelHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let skipped = channel.skipped_counter();
        let worker = Self {
            channel,
            commands: rx,
        };
        let task = tokio::spawn(worker.run());
        (ChannelHandle { tx, skipped }, task)
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Exchange { message, reply } => {
                    let result = self.channel.exchange(&message).await;
                    if let Err(e) = &result {
                        tracing::warn!(id = ?message.id(), error = %e, "Exchange with child failed");
                    }
                    // Caller may have gone away; the reply was still consumed.
                    let _ = reply.send(result);
                }
                Command::Notify { message } => {
                    if let Err(e) = self.channel.notify(&message).await {
                        tracing::warn!(method = ?message.method(), error = %e, "Forwarding notification failed");
                    }
                }
            }
        }
        tracing::debug!("Exchange worker stopped");
    }
}

/// Cloneable front-end to the [`ExchangeWorker`].
#[derive(Clone)]
pub struct ChannelHandle {
    tx: mpsc::Sender<Command>,
    skipped: Arc<AtomicU64>,
}

impl ChannelHandle {
    pub async fn exchange(
        &self,
        message: ProtocolMessage,
    ) -> Result<ProtocolMessage, ExchangeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Exchange { message, reply })
            .await
            .map_err(|_| ExchangeError::Closed)?;
        rx.await.map_err(|_| ExchangeError::Closed)?
    }

    /// Queue `message` for the child. Returns once queued; it is written
    /// after every exchange queued before it.
    pub async fn notify(&self, message: ProtocolMessage) -> Result<(), ExchangeError> {
        self.tx
            .send(Command::Notify { message })
            .await
            .map_err(|_| ExchangeError::Closed)
    }

    pub fn skipped_lines(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}


#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use super::fake::{Behavior, spawn};
    use super::*;
    use serde_json::json;
    use tokio::io::ReadBuf;

    fn request(id: u64) -> ProtocolMessage {
        ProtocolMessage::from_value(
            json!({"jsonrpc": "2.0", "id": id, "method": format!("m{id}")}),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn exchange_skips_log_lines() {
        let (mut channel, child) = spawn(Behavior::Echo);

        let reply = channel.exchange(&request(1)).await.unwrap();

        assert_eq!(reply.id(), Some(&json!(1)));
        assert_eq!(reply.fields()["result"], "m1");
        assert_eq!(channel.skipped_counter().load(Ordering::Relaxed), 1);
        assert_eq!(child.received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exchange_fails_when_child_hangs_up() {
        let (mut channel, _child) = spawn(Behavior::Hangup);

        let err = channel.exchange(&request(1)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::ChildClosed));
    }

    #[tokio::test]
    async fn notify_writes_without_reading() {
        let (mut channel, child) = spawn(Behavior::Echo);
        let note =
            ProtocolMessage::from_value(json!({"jsonrpc": "2.0", "method": "initialized"}))
                .unwrap();

        channel.notify(&note).await.unwrap();
        let reply = channel.exchange(&request(2)).await.unwrap();

        assert_eq!(reply.id(), Some(&json!(2)));
        assert_eq!(child.received.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_exchanges_are_paired() {
        let (channel, child) = spawn(Behavior::Echo);
        let (handle, _task) = ExchangeWorker::spawn(channel);

        let calls = (0..50u64).map(|id| {
            let handle = handle.clone();
            tokio::spawn(async move { (id, handle.exchange(request(id)).await) })
        });
        let results = futures::future::join_all(calls).await;

        for joined in results {
            let (id, reply) = joined.unwrap();
            let reply = reply.unwrap();
            assert_eq!(reply.id(), Some(&json!(id)));
            assert_eq!(reply.fields()["result"], format!("m{id}"));
        }
        assert_eq!(child.received.load(Ordering::SeqCst), 50);
        assert_eq!(child.lines.lock().unwrap().len(), 50);
        assert_eq!(handle.skipped_lines(), 50);
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_desync_pairing() {
        let release = Arc::new(tokio::sync::Notify::new());
        let (channel, child) = spawn(Behavior::Held(Arc::clone(&release)));
        let (handle, _task) = ExchangeWorker::spawn(channel);

        let abandoned = handle.clone();
        let call = tokio::spawn(async move { abandoned.exchange(request(1)).await });

        // Wait until the worker has written request 1 and is blocked on its reply.
        tokio::time::timeout(Duration::from_secs(5), async {
            while child.received.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());

        let next = handle.clone();
        let second = tokio::spawn(async move { next.exchange(request(2)).await });
        release.notify_one();
        tokio::time::timeout(Duration::from_secs(5), async {
            while child.received.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        release.notify_one();

        let reply = second.await.unwrap().unwrap();
        assert_eq!(reply.id(), Some(&json!(2)));
    }

    #[tokio::test]
    async fn invalid_utf8_output_keeps_pairing() {
        let (mut channel, _child) = spawn(Behavior::GarbledEcho);

        for id in 1..=3 {
            let reply = channel.exchange(&request(id)).await.unwrap();
            assert_eq!(reply.id(), Some(&json!(id)));
        }
        assert_eq!(channel.skipped_counter().load(Ordering::Relaxed), 3);
        assert!(!channel.is_poisoned());
    }

    /// Reader that fails once, then serves `rest`.
    struct FailOnce {
        failed: bool,
        rest: &'static [u8],
    }

    impl AsyncRead for FailOnce {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if !self.failed {
                self.failed = true;
                return Poll::Ready(Err(std::io::Error::other("pipe broke")));
            }
            Pin::new(&mut self.rest).poll_read(cx, buf)
        }
    }

    #[tokio::test]
    async fn io_error_poisons_channel() {
        let reader = FailOnce {
            failed: false,
            rest: b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"m1\"}\n",
        };
        let mut channel = LineChannel::new(tokio::io::sink(), reader);

        let err = channel.exchange(&request(1)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Io(_)));
        assert!(channel.is_poisoned());

        // The stale reply for request 1 must never be handed to request 2.
        let err = channel.exchange(&request(2)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Poisoned));
        let note =
            ProtocolMessage::from_value(json!({"jsonrpc": "2.0", "method": "initialized"}))
                .unwrap();
        assert!(matches!(
            channel.notify(&note).await,
            Err(ExchangeError::Poisoned)
        ));
    }

    #[tokio::test]
    async fn handle_reports_closed_worker() {
        let (channel, _child) = spawn(Behavior::Echo);
        let (handle, task) = ExchangeWorker::spawn(channel);
        task.abort();
        let _ = task.await;

        let err = handle.exchange(request(1)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Closed));
    }
}
