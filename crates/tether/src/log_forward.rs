//! Tracing layer that ships events to the parent as `LogMessage` messages.
//!
//! Body: `{"target": ..., "level": "info", "message": ...}` on topic `log`.
//! Events from the channel and bridge modules are never forwarded, otherwise a
//! send that logs would feed itself. Storage events are forwarded and stored;
//! [`LogStorage`] implementations must not log while holding their own locks.

use std::sync::Arc;

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::protocol::{MessageType, ProcessIdentity};
use crate::channel::ChannelHandle;
use crate::log_storage::{LogCategory, LogEntry, LogStorage};

pub const LOG_TOPIC: &str = "log";

const SKIPPED_TARGETS: &[&str] = &["tether::channel", "tether::bridge"];

pub struct LogForwardLayer {
    channel: ChannelHandle,
    identity: ProcessIdentity,
    min_level: Level,
    storage: Option<Arc<dyn LogStorage>>,
}

impl LogForwardLayer {
    /// Forward `INFO` and above.
    pub fn new(channel: ChannelHandle, identity: ProcessIdentity) -> Self {
        Self {
            channel,
            identity,
            min_level: Level::INFO,
            storage: None,
        }
    }

    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    /// Also write every forwarded event to `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn LogStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    fn level_to_string(level: &Level) -> &'static str {
        match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        }
    }

    fn is_skipped(target: &str) -> bool {
        SKIPPED_TARGETS
            .iter()
            .any(|prefix| target.starts_with(prefix))
    }
}

impl<S> Layer<S> for LogForwardLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Level ordering is by verbosity: TRACE > DEBUG > ... > ERROR.
        if *metadata.level() > self.min_level || Self::is_skipped(metadata.target()) {
            return;
        }

        let target = metadata.target();
        let level = Self::level_to_string(metadata.level());
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        if let Some(storage) = &self.storage {
            let entry = LogEntry::new(
                (*metadata.level()).into(),
                LogCategory::System,
                self.identity.process_id.clone(),
                visitor.message.clone(),
            )
            .with_location(
                metadata.module_path().unwrap_or(target),
                "",
                metadata.line().unwrap_or(0),
            );
            let _ = storage.write_log(entry);
        }

        let message = self
            .identity
            .message(MessageType::LogMessage, LOG_TOPIC)
            .with_field("target", target)
            .with_field("level", level)
            .with_field("message", visitor.message);
        self.channel.send(message);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}
