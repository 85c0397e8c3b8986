//! Sub-process lifecycle.
//!
//! [`SubProcess`] owns the bookkeeping every worker process needs: the state
//! machine, the configuration store, the injected channel and the status
//! reporter. A concrete process supplies a [`Worker`] with the domain hooks.
//!
//! ```text
//! NotInitialized → Initializing → Initialized → Running → Stopping → Stopped
//!                        └──────────→ Error ←───────┘ (start failure)
//! ```
//!
//! Inbound messages from the injected channel are dispatched on a background
//! task to [`SubProcess::handle_message`], which merges `ConfigUpdate` patches
//! into the store before the worker sees them.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Message, MessageType, ProcessIdentity};
use crate::channel::{ChannelError, ChannelEvent, MessageChannel};
use crate::config::{ConfigError, ConfigStore};
use crate::log_storage::LogStorage;
use crate::state::ProcessState;
use crate::status::StatusReporter;

pub use crate::channel::ChannelHandle;

pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 5000;
pub const REPORT_INTERVAL_KEY: &str = "reporting.interval_ms";

const EVENT_CAPACITY: usize = 64;

/// Errors returned by worker hooks.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("initialization failed: {message}")]
    Initialize { message: String },

    #[error("start failed: {message}")]
    Start { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WorkerError {
    pub fn initialize(message: impl Into<String>) -> Self {
        Self::Initialize {
            message: message.into(),
        }
    }

    pub fn start(message: impl Into<String>) -> Self {
        Self::Start {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Errors from lifecycle operations.
///
/// `InvalidState` is a sequencing error and leaves the state unchanged; the
/// others move the process to `Error`.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{operation} called in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ProcessState,
    },

    #[error("failed to load configuration: {0}")]
    Config(#[source] ConfigError),

    #[error("worker initialization failed: {0}")]
    Initialize(#[source] WorkerError),

    #[error("worker start failed: {0}")]
    Start(#[source] WorkerError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    StateChanged(ProcessState),
    /// A failed lifecycle call or configuration update.
    Error(String),
    Started,
    Stopped,
}

/// Domain hooks for a concrete sub-process.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Domain setup. Usually creates the channel and injects it with
    /// [`ProcessContext::set_channel`]. `config` is the raw input; the merged
    /// tree is in [`ProcessContext::config`].
    async fn on_initialize(&self, ctx: &ProcessContext, config: &Value) -> Result<(), WorkerError>;

    /// Usually starts the channel.
    async fn on_start(&self, ctx: &ProcessContext) -> Result<(), WorkerError>;

    async fn on_stop(&self, ctx: &ProcessContext);

    /// Every inbound message other than `HeartbeatAck`. For `ConfigUpdate` the
    /// store already holds the merged patch.
    async fn on_handle_message(&self, ctx: &ProcessContext, message: &Message);
}

/// State shared between the lifecycle and the worker hooks.
pub struct ProcessContext {
    identity: ProcessIdentity,
    config: Arc<ConfigStore>,
    channel: ChannelHandle,
    reporter: StatusReporter,
    state: watch::Sender<ProcessState>,
    events: broadcast::Sender<ProcessEvent>,
    log_storage: RwLock<Option<Arc<dyn LogStorage>>>,
    /// Event receivers for newly injected channels, handed to the dispatcher.
    rebind: mpsc::UnboundedSender<broadcast::Receiver<ChannelEvent>>,
}

impl ProcessContext {
    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn channel(&self) -> Option<Arc<dyn MessageChannel>> {
        self.channel.get()
    }

    /// Shared slot for components that send on whatever channel is current.
    pub fn channel_handle(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Inject the channel. Its inbound messages are dispatched from now on.
    pub fn set_channel(&self, channel: Arc<dyn MessageChannel>) {
        // Subscribe before publishing so nothing received in between is lost.
        let events = channel.subscribe_events();
        channel.set_process_state(self.state());
        tracing::debug!(process_id = %self.identity.process_id, "Channel injected");
        self.channel.set(Some(channel));
        let _ = self.rebind.send(events);
    }

    pub fn status_reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    pub fn log_storage(&self) -> Option<Arc<dyn LogStorage>> {
        self.log_storage
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// New message addressed from this process to its parent.
    pub fn message(&self, kind: MessageType, topic: &str) -> Message {
        self.identity.message(kind, topic)
    }

    /// Queue `message` on the current channel.
    pub fn send(&self, message: Message) -> bool {
        self.channel.send(message)
    }

    fn set_state(&self, next: ProcessState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if !changed {
            return;
        }
        tracing::debug!(process_id = %self.identity.process_id, state = %next, "Process state changed");
        if let Some(channel) = self.channel.get() {
            channel.set_process_state(next);
        }
        let _ = self.events.send(ProcessEvent::StateChanged(next));
    }

    fn emit(&self, event: ProcessEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, message: String) {
        tracing::warn!(process_id = %self.identity.process_id, error = %message, "Process error");
        self.emit(ProcessEvent::Error(message));
    }
}

struct Inner<W: Worker> {
    worker: W,
    ctx: ProcessContext,
    /// Serializes initialize/start/stop.
    lifecycle: tokio::sync::Mutex<()>,
    pending_rebind: Mutex<Option<mpsc::UnboundedReceiver<broadcast::Receiver<ChannelEvent>>>>,
    dispatcher: Mutex<Option<CancellationToken>>,
}

impl<W: Worker> Drop for Inner<W> {
    fn drop(&mut self) {
        if let Some(cancel) = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            cancel.cancel();
        }
    }
}

/// A worker sub-process. Clones share the same process.
pub struct SubProcess<W: Worker> {
    inner: Arc<Inner<W>>,
}

impl<W: Worker> Clone for SubProcess<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Worker> SubProcess<W> {
    pub fn new(worker: W, identity: ProcessIdentity) -> Self {
        let channel = ChannelHandle::new();
        let reporter = StatusReporter::new(channel.clone(), identity.clone());
        let (state, _) = watch::channel(ProcessState::NotInitialized);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (rebind, pending) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                worker,
                ctx: ProcessContext {
                    identity,
                    config: Arc::new(ConfigStore::with_defaults()),
                    channel,
                    reporter,
                    state,
                    events,
                    log_storage: RwLock::new(None),
                    rebind,
                },
                lifecycle: tokio::sync::Mutex::new(()),
                pending_rebind: Mutex::new(Some(pending)),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Load `config` over the defaults and run the worker's setup.
    pub async fn initialize(&self, config: Value) -> Result<(), LifecycleError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let ctx = &self.inner.ctx;

        let state = ctx.state();
        if state != ProcessState::NotInitialized {
            return Err(self.sequencing_error("initialize", state));
        }

        self.spawn_dispatcher();
        ctx.set_state(ProcessState::Initializing);

        if let Err(err) = ctx.config.load_from_json(&config) {
            return Err(self.fail(LifecycleError::Config(err)));
        }

        match self.inner.worker.on_initialize(ctx, &config).await {
            Ok(()) => {
                ctx.set_state(ProcessState::Initialized);
                tracing::info!(process_id = %ctx.identity.process_id, "Process initialized");
                Ok(())
            }
            Err(err) => Err(self.fail(LifecycleError::Initialize(err))),
        }
    }

    /// Run the worker's startup and begin status reporting.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let ctx = &self.inner.ctx;

        let state = ctx.state();
        if state != ProcessState::Initialized {
            return Err(self.sequencing_error("start", state));
        }

        if let Err(err) = self.inner.worker.on_start(ctx).await {
            return Err(self.fail(LifecycleError::Start(err)));
        }

        ctx.set_state(ProcessState::Running);
        let interval_ms = ctx
            .config
            .get_or(REPORT_INTERVAL_KEY, DEFAULT_REPORT_INTERVAL_MS);
        if !ctx
            .reporter
            .start_reporting(Duration::from_millis(interval_ms))
        {
            tracing::warn!(interval_ms, "Status reporting not started");
        }
        tracing::info!(process_id = %ctx.identity.process_id, interval_ms, "Process started");
        ctx.emit(ProcessEvent::Started);
        Ok(())
    }

    /// No-op unless `Running` or `Initialized`.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let ctx = &self.inner.ctx;

        let state = ctx.state();
        if !matches!(state, ProcessState::Running | ProcessState::Initialized) {
            tracing::debug!(%state, "Stop ignored");
            return;
        }

        ctx.set_state(ProcessState::Stopping);
        ctx.reporter.stop_reporting();
        self.inner.worker.on_stop(ctx).await;
        ctx.set_state(ProcessState::Stopped);
        self.stop_dispatcher();
        tracing::info!(process_id = %ctx.identity.process_id, "Process stopped");
        ctx.emit(ProcessEvent::Stopped);
    }

    /// Apply `ConfigUpdate` patches, then hand the message to the worker.
    pub async fn handle_message(&self, message: Message) {
        let ctx = &self.inner.ctx;
        if message.kind == MessageType::ConfigUpdate {
            match ctx.config.load_from_json(&Value::Object(message.body.clone())) {
                Ok(kind) => tracing::debug!(?kind, msg_id = %message.id, "Applied configuration update"),
                Err(err) => ctx.emit_error(format!("configuration update rejected: {err}")),
            }
        }
        self.inner.worker.on_handle_message(ctx, &message).await;
    }

    pub fn set_channel(&self, channel: Arc<dyn MessageChannel>) {
        self.inner.ctx.set_channel(channel);
    }

    pub fn channel(&self) -> Option<Arc<dyn MessageChannel>> {
        self.inner.ctx.channel()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        self.inner.ctx.config()
    }

    pub fn status_reporter(&self) -> &StatusReporter {
        self.inner.ctx.status_reporter()
    }

    pub fn state(&self) -> ProcessState {
        self.inner.ctx.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.inner.ctx.watch_state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProcessEvent> {
        self.inner.ctx.events.subscribe()
    }

    pub fn set_log_storage(&self, storage: Arc<dyn LogStorage>) {
        *self
            .inner
            .ctx
            .log_storage
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(storage);
    }

    pub fn log_storage(&self) -> Option<Arc<dyn LogStorage>> {
        self.inner.ctx.log_storage()
    }

    pub fn identity(&self) -> &ProcessIdentity {
        self.inner.ctx.identity()
    }

    pub fn worker(&self) -> &W {
        &self.inner.worker
    }

    pub fn context(&self) -> &ProcessContext {
        &self.inner.ctx
    }

    fn sequencing_error(&self, operation: &'static str, state: ProcessState) -> LifecycleError {
        let err = LifecycleError::InvalidState { operation, state };
        self.inner.ctx.emit_error(err.to_string());
        err
    }

    /// `Error` is terminal, so inbound dispatch ends here too.
    fn fail(&self, err: LifecycleError) -> LifecycleError {
        self.inner.ctx.emit_error(err.to_string());
        self.inner.ctx.set_state(ProcessState::Error);
        self.stop_dispatcher();
        err
    }

    fn spawn_dispatcher(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime, inbound messages will not be dispatched");
            return;
        };
        let Some(rebind) = self
            .inner
            .pending_rebind
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            return;
        };

        let cancel = CancellationToken::new();
        *self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(cancel.clone());
        handle.spawn(dispatch_loop(Arc::downgrade(&self.inner), rebind, cancel));
    }

    fn stop_dispatcher(&self) {
        if let Some(cancel) = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            cancel.cancel();
        }
    }
}

async fn dispatch_loop<W: Worker>(
    process: Weak<Inner<W>>,
    mut rebind: mpsc::UnboundedReceiver<broadcast::Receiver<ChannelEvent>>,
    cancel: CancellationToken,
) {
    let mut events: Option<broadcast::Receiver<ChannelEvent>> = None;
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rebind.recv() => match next {
                Some(receiver) => {
                    events = Some(receiver);
                    continue;
                }
                None => break,
            },
            event = next_event(&mut events) => event,
        };

        match event {
            Ok(ChannelEvent::MessageReceived(message)) => {
                let Some(inner) = process.upgrade() else {
                    break;
                };
                SubProcess { inner }.handle_message(message).await;
            }
            Ok(ChannelEvent::Error(err)) => {
                tracing::debug!(error = %err, "Channel reported an error");
            }
            Ok(ChannelEvent::TopicSubscriptionChanged { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Message dispatcher lagged, inbound messages dropped");
            }
            Err(RecvError::Closed) => events = None,
        }
    }
    tracing::trace!("Message dispatcher stopped");
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<ChannelEvent>>,
) -> Result<ChannelEvent, RecvError> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
