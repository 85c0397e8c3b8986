//! Default channel protocol driver.
//!
//! One task per channel owns the transport and runs, in order:
//! connect → Hello → drain → session loop (inbound frames, heartbeat tick,
//! drain notifications) → reconnect delay. Callers only touch shared state
//! behind short locks and wake the driver through [`Notify`].

use std::io;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashSet;
use futures::StreamExt;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::queue::OutgoingQueue;
use super::{ChannelConfig, ChannelError, ChannelEvent, ChannelStats, MessageChannel, Transport};
use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{Message, MessageType, ProcessIdentity, now_millis};
use crate::bridge::transport::LocalTransport;
use crate::state::{ConnectionState, ProcessState};

/// Channel over the local socket named by `ChannelConfig::server_name`.
pub type LocalChannel = IpcChannel<LocalTransport>;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error("failed to encode {kind} message: {source}")]
    Encode {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
}

impl SessionError {
    fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::ConnectTimeout { .. })
    }
}

enum SessionEnd {
    Cancelled,
    Closed,
    Failed(SessionError),
}

struct Shared {
    config: ChannelConfig,
    identity: ProcessIdentity,
    state: watch::Sender<ConnectionState>,
    queue: Mutex<OutgoingQueue>,
    drain: Notify,
    events: broadcast::Sender<ChannelEvent>,
    topics: DashSet<String>,
    process_state: Mutex<ProcessState>,
    /// 0 until the first ack.
    last_ack: AtomicI64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    connection_attempts: AtomicU64,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, OutgoingQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Outgoing queue mutex poisoned");
            poisoned.into_inner()
        })
    }

    fn process_state(&self) -> ProcessState {
        *self
            .process_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next` unless the channel has been stopped.
    ///
    /// The cancellation check runs under the watch lock, so a concurrent `stop()`
    /// always has the last word.
    fn transition(&self, cancel: &CancellationToken, next: ConnectionState) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|state| {
            if cancel.is_cancelled() {
                return false;
            }
            applied = true;
            if *state == next {
                return false;
            }
            tracing::debug!(from = %state, to = %next, "Connection state changed");
            *state = next;
            true
        });
        applied
    }

    fn on_message(&self, message: Message) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        if message.kind == MessageType::HeartbeatAck {
            self.last_ack.store(now_millis(), Ordering::Relaxed);
            tracing::trace!(msg_id = %message.id, "Heartbeat acknowledged");
            return;
        }
        tracing::debug!(kind = %message.kind, topic = %message.topic, msg_id = %message.id, "Received message");
        let _ = self.events.send(ChannelEvent::MessageReceived(message));
    }
}

struct Driver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The default [`MessageChannel`] over any [`Transport`].
pub struct IpcChannel<T: Transport> {
    shared: Arc<Shared>,
    transport: Arc<T>,
    driver: Mutex<Option<Driver>>,
}

impl<T: Transport> IpcChannel<T> {
    pub fn new(
        transport: T,
        identity: ProcessIdentity,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let queue = OutgoingQueue::new(config.max_queue_size);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                identity,
                state,
                queue: Mutex::new(queue),
                drain: Notify::new(),
                events,
                topics: DashSet::new(),
                process_state: Mutex::new(ProcessState::Running),
                last_ack: AtomicI64::new(0),
                messages_sent: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
                connection_attempts: AtomicU64::new(0),
            }),
            transport: Arc::new(transport),
            driver: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Messages waiting in the outgoing queue.
    pub fn queued_messages(&self) -> usize {
        self.shared.queue().len()
    }

    /// Whether the driver task is alive.
    pub fn is_running(&self) -> bool {
        self.driver()
            .as_ref()
            .is_some_and(|driver| !driver.task.is_finished())
    }

    fn driver(&self) -> MutexGuard<'_, Option<Driver>> {
        self.driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl IpcChannel<LocalTransport> {
    /// Channel to the local socket named by `config.server_name`.
    pub fn local(identity: ProcessIdentity, config: ChannelConfig) -> Result<Self, ChannelError> {
        let transport = LocalTransport::new(&config.server_name);
        Self::new(transport, identity, config)
    }
}

impl<T: Transport> MessageChannel for IpcChannel<T> {
    fn start(&self) -> Result<(), ChannelError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;
        let mut driver = self.driver();
        if driver
            .as_ref()
            .is_some_and(|existing| !existing.task.is_finished())
        {
            return Err(ChannelError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let task = handle.spawn(run_driver(
            Arc::clone(&self.shared),
            Arc::clone(&self.transport),
            cancel.clone(),
        ));
        *driver = Some(Driver { cancel, task });
        tracing::info!(
            endpoint = %self.transport.endpoint(),
            process_id = %self.shared.identity.process_id,
            "Channel started"
        );
        Ok(())
    }

    fn stop(&self) {
        if let Some(driver) = self.driver().take() {
            // Level-based: an in-flight write is left to finish or fail.
            driver.cancel.cancel();
            tracing::info!(endpoint = %self.transport.endpoint(), "Channel stopped");
        }
        self.shared.state.send_if_modified(|state| {
            let changed = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            changed
        });
        self.shared.queue().clear();
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.current_state()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    fn send_message(&self, message: Message) -> bool {
        let evicted = self.shared.queue().push(message);
        if let Some(dropped) = evicted {
            tracing::debug!(msg_id = %dropped.id, kind = %dropped.kind, "Outgoing queue full, dropped oldest message");
        }
        if self.is_connected() {
            self.shared.drain.notify_one();
            true
        } else {
            false
        }
    }

    fn subscribe_to_topic(&self, topic: &str) -> bool {
        if topic.is_empty() || !self.shared.topics.insert(topic.to_string()) {
            return false;
        }
        tracing::debug!(%topic, "Subscribed to topic");
        let _ = self.shared.events.send(ChannelEvent::TopicSubscriptionChanged {
            topic: topic.to_string(),
            subscribed: true,
        });
        true
    }

    fn unsubscribe_from_topic(&self, topic: &str) -> bool {
        if self.shared.topics.remove(topic).is_none() {
            return false;
        }
        tracing::debug!(%topic, "Unsubscribed from topic");
        let _ = self.shared.events.send(ChannelEvent::TopicSubscriptionChanged {
            topic: topic.to_string(),
            subscribed: false,
        });
        true
    }

    fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.shared.topics.iter().map(|t| t.key().clone()).collect();
        topics.sort();
        topics
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    fn set_process_state(&self, state: ProcessState) {
        *self
            .shared
            .process_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn last_heartbeat_ack(&self) -> Option<i64> {
        match self.shared.last_ack.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    fn identity(&self) -> &ProcessIdentity {
        &self.shared.identity
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.shared.messages_sent.load(Ordering::Relaxed),
            messages_received: self.shared.messages_received.load(Ordering::Relaxed),
            connection_attempts: self.shared.connection_attempts.load(Ordering::Relaxed),
        }
    }
}

impl<T: Transport> Drop for IpcChannel<T> {
    fn drop(&mut self) {
        if let Some(driver) = self.driver().take() {
            driver.cancel.cancel();
        }
    }
}

async fn run_driver<T: Transport>(
    shared: Arc<Shared>,
    transport: Arc<T>,
    cancel: CancellationToken,
) {
    let endpoint = transport.endpoint();
    tracing::debug!(%endpoint, "Channel driver started");

    loop {
        if !shared.transition(&cancel, ConnectionState::Connecting) {
            break;
        }
        shared.connection_attempts.fetch_add(1, Ordering::Relaxed);

        let end = match connect(&shared, &*transport, &cancel).await {
            None => SessionEnd::Cancelled,
            Some(Ok((reader, writer))) => {
                run_session(&shared, &*transport, reader, writer, &cancel).await
            }
            Some(Err(err)) => SessionEnd::Failed(err),
        };

        match end {
            SessionEnd::Cancelled => break,
            SessionEnd::Closed => {
                tracing::info!(%endpoint, "Parent closed the connection");
                shared.transition(&cancel, ConnectionState::Disconnected);
            }
            SessionEnd::Failed(err) => {
                if err.is_connect() {
                    tracing::debug!(%endpoint, error = %err, "Connection attempt failed");
                } else {
                    tracing::warn!(%endpoint, error = %err, "Connection lost");
                }
                if shared.transition(&cancel, ConnectionState::Error) {
                    let _ = shared.events.send(ChannelEvent::Error(err.to_string()));
                }
            }
        }

        if !shared.config.auto_reconnect_enabled {
            tracing::info!(%endpoint, "Auto-reconnect disabled, channel driver exiting");
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.config.reconnect_interval()) => {}
        }
    }

    tracing::debug!(%endpoint, "Channel driver stopped");
}

/// `None` if cancelled while connecting.
async fn connect<T: Transport>(
    shared: &Shared,
    transport: &T,
    cancel: &CancellationToken,
) -> Option<Result<(T::Reader, T::Writer), SessionError>> {
    let timeout = shared.config.connection_timeout();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = tokio::time::timeout(timeout, transport.connect()) => Some(match result {
            Ok(Ok(halves)) => Ok(halves),
            Ok(Err(source)) => Err(SessionError::Connect {
                endpoint: transport.endpoint(),
                source,
            }),
            Err(_) => Err(SessionError::ConnectTimeout {
                endpoint: transport.endpoint(),
                timeout,
            }),
        }),
    }
}

async fn run_session<T: Transport>(
    shared: &Shared,
    transport: &T,
    reader: T::Reader,
    mut writer: T::Writer,
    cancel: &CancellationToken,
) -> SessionEnd {
    if !shared.transition(cancel, ConnectionState::Connected) {
        return SessionEnd::Cancelled;
    }
    tracing::info!(
        endpoint = %transport.endpoint(),
        process_id = %shared.identity.process_id,
        "Connected to parent"
    );

    // Hello bypasses the queue so it is always the first frame of a connection.
    if let Err(err) = send_direct(shared, transport, &mut writer, &shared.identity.hello()).await {
        return SessionEnd::Failed(err);
    }
    shared.drain.notify_one();

    let mut frames = FramedRead::new(reader, JsonLinesCodec::<Message>::new());
    let period = shared.config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            frame = frames.next() => match frame {
                Some(Ok(Ok(message))) => shared.on_message(message),
                Some(Ok(Err(err))) => tracing::warn!(error = %err, "Discarding malformed frame"),
                Some(Err(err)) => return SessionEnd::Failed(SessionError::Read(err)),
                None => return SessionEnd::Closed,
            },
            _ = heartbeat.tick() => {
                if shared.current_state() == ConnectionState::Connected {
                    let beat = shared.identity.heartbeat(shared.process_state().as_str());
                    if let Err(err) = send_direct(shared, transport, &mut writer, &beat).await {
                        return SessionEnd::Failed(err);
                    }
                    tracing::trace!(msg_id = %beat.id, "Heartbeat sent");
                }
            }
            _ = shared.drain.notified() => {
                if let Err(err) = drain_one(shared, transport, &mut writer).await {
                    return SessionEnd::Failed(err);
                }
            }
        }
    }
}

/// Write the queue head; dequeue only after a complete write.
async fn drain_one<T: Transport>(
    shared: &Shared,
    transport: &T,
    writer: &mut T::Writer,
) -> Result<(), SessionError> {
    let head = shared.queue().front().cloned();
    let Some(head) = head else {
        return Ok(());
    };

    match head.to_frame() {
        Ok(frame) => {
            write_frame(shared, transport, writer, &frame).await?;
            shared.messages_sent.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(msg_id = %head.id, kind = %head.kind, "Sent queued message");
        }
        Err(err) => {
            tracing::warn!(msg_id = %head.id, error = %err, "Dropping message that failed to encode");
        }
    }

    let remaining = {
        let mut queue = shared.queue();
        queue.pop_front_if(&head.id);
        queue.len()
    };
    if remaining > 0 {
        shared.drain.notify_one();
    }
    Ok(())
}

async fn send_direct<T: Transport>(
    shared: &Shared,
    transport: &T,
    writer: &mut T::Writer,
    message: &Message,
) -> Result<(), SessionError> {
    let frame = message.to_frame().map_err(|source| SessionError::Encode {
        kind: message.kind,
        source,
    })?;
    write_frame(shared, transport, writer, &frame).await?;
    shared.messages_sent.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

async fn write_frame<T: Transport>(
    shared: &Shared,
    transport: &T,
    writer: &mut T::Writer,
    frame: &[u8],
) -> Result<(), SessionError> {
    let timeout = shared.config.write_timeout();
    let written = tokio::time::timeout(timeout, transport.write_data(writer, frame))
        .await
        .map_err(|_| SessionError::WriteTimeout(timeout))?
        .map_err(SessionError::Write)?;
    if written != frame.len() {
        return Err(SessionError::ShortWrite {
            written,
            expected: frame.len(),
        });
    }
    Ok(())
}
