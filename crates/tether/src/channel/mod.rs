//! Connection channel to the parent process.
//!
//! [`MessageChannel`] is the contract the lifecycle and workers program against.
//! [`IpcChannel`](ipc::IpcChannel) implements the default protocol (hello,
//! heartbeat, reconnect, queue draining) once, on top of any [`Transport`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch};

use crate::bridge::protocol::{Message, ProcessIdentity};
use crate::state::{ConnectionState, ProcessState};

pub mod ipc;
pub mod queue;

pub use ipc::{IpcChannel, LocalChannel};
pub use queue::OutgoingQueue;

pub const DEFAULT_SERVER_NAME: &str = "master_ipc_server";
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid channel configuration: {0}")]
    InvalidConfig(String),

    #[error("channel is already running")]
    AlreadyRunning,

    /// `start()` was called outside a tokio runtime.
    #[error("no tokio runtime available to drive the channel")]
    NoRuntime,
}

/// Byte transport underneath the channel protocol.
///
/// Implementations only move bytes; framing, hello, heartbeat and reconnect live
/// in [`IpcChannel`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    /// Open a connection to the parent.
    async fn connect(&self) -> io::Result<(Self::Reader, Self::Writer)>;

    /// Write one complete frame. Returns the number of bytes written; anything
    /// short of `data.len()` leaves the message queued for retry.
    async fn write_data(&self, writer: &mut Self::Writer, data: &[u8]) -> io::Result<usize>;

    /// Human-readable address for logs.
    fn endpoint(&self) -> String;
}

/// Notifications published by a channel.
///
/// Connection state changes are not events; they go out on the
/// [`watch_state`](MessageChannel::watch_state) channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Any inbound message other than `HeartbeatAck`.
    MessageReceived(Message),
    /// Transport fault or failed connection attempt.
    Error(String),
    TopicSubscriptionChanged { topic: String, subscribed: bool },
}

/// Counters kept since the channel was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connection_attempts: u64,
}

/// Channel contract shared by every transport.
pub trait MessageChannel: Send + Sync {
    /// Spawn the driver and begin connecting. The first attempt is immediate.
    fn start(&self) -> Result<(), ChannelError>;

    /// Stop timers and drop the connection. Clears the outgoing queue.
    fn stop(&self);

    fn connection_state(&self) -> ConnectionState;

    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Queue a message for delivery.
    ///
    /// Returns `true` if a drain was scheduled, `false` if the channel is not
    /// connected. The message is queued either way.
    fn send_message(&self, message: Message) -> bool;

    /// Tag `message` with `topic` and queue it.
    fn publish_to_topic(&self, topic: &str, message: Message) -> bool {
        self.send_message(message.with_topic(topic))
    }

    /// Returns `false` if the topic was already subscribed or is empty.
    fn subscribe_to_topic(&self, topic: &str) -> bool;

    /// Returns `false` if the topic was not subscribed.
    fn unsubscribe_from_topic(&self, topic: &str) -> bool;

    /// Subscribed topics, sorted.
    fn subscribed_topics(&self) -> Vec<String>;

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;

    /// State snapshot carried by outgoing heartbeats.
    fn set_process_state(&self, state: ProcessState);

    /// Time of the last `HeartbeatAck` in ms since the epoch.
    fn last_heartbeat_ack(&self) -> Option<i64>;

    fn identity(&self) -> &ProcessIdentity;

    fn stats(&self) -> ChannelStats;
}

/// Shared, swappable slot holding the currently injected channel.
///
/// Cloned into every component that sends (lifecycle, status reporter, log
/// forwarder) so a channel injected later is seen by all of them.
#[derive(Clone)]
pub struct ChannelHandle {
    slot: Arc<watch::Sender<Option<Arc<dyn MessageChannel>>>>,
}

impl Default for ChannelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHandle {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Replace the channel. Returns the previous one.
    pub fn set(
        &self,
        channel: Option<Arc<dyn MessageChannel>>,
    ) -> Option<Arc<dyn MessageChannel>> {
        self.slot.send_replace(channel)
    }

    pub fn get(&self) -> Option<Arc<dyn MessageChannel>> {
        self.slot.borrow().clone()
    }

    /// Notified whenever a channel is injected or removed.
    pub fn watch(&self) -> watch::Receiver<Option<Arc<dyn MessageChannel>>> {
        self.slot.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.slot
            .borrow()
            .as_ref()
            .is_some_and(|channel| channel.is_connected())
    }

    /// Queue on the current channel. `false` if there is none or it is not connected.
    pub fn send(&self, message: Message) -> bool {
        match self.get() {
            Some(channel) => channel.send_message(message),
            None => {
                tracing::trace!(kind = %message.kind, "No channel injected, message dropped");
                false
            }
        }
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("injected", &self.slot.borrow().is_some())
            .finish()
    }
}

/// Channel settings, usually the `ipc` object of the process configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub server_name: String,
    pub reconnect_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_queue_size: usize,
    pub connection_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub auto_reconnect_enabled: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            auto_reconnect_enabled: true,
        }
    }
}

impl ChannelConfig {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ..Self::default()
        }
    }

    /// Parse and validate. Missing keys take their defaults; unknown keys are ignored.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ChannelError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| ChannelError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.server_name.is_empty() {
            return Err(ChannelError::InvalidConfig(
                "server_name must not be empty".to_string(),
            ));
        }
        let zeroes = [
            ("reconnect_interval_ms", self.reconnect_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("max_queue_size", self.max_queue_size as u64),
            ("connection_timeout_ms", self.connection_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
        ];
        for (key, value) in zeroes {
            if value == 0 {
                return Err(ChannelError::InvalidConfig(format!(
                    "{key} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect_enabled = enabled;
        self
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
