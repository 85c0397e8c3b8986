//! Periodic status reports to the parent.
//!
//! A [`StatusReporter`] asks its [`StatusCollector`] for a payload on every tick
//! and sends it as a `StatusReport` on topic `status`, but only while the channel
//! is connected. The connection is checked before collecting and again before
//! sending; no lock is held while the collector runs.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{Map, Value, json};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{MessageType, ProcessIdentity, now_millis};
use crate::channel::ChannelHandle;

pub const STATUS_TOPIC: &str = "status";

/// Produces the body of a `StatusReport`.
///
/// Called from the blocking pool on timer ticks, so it may do slow work.
pub trait StatusCollector: Send + Sync + 'static {
    fn collect_status(&self) -> Map<String, Value>;
}

/// Base payload: `timestamp`, `status: "running"`, `cpu_usage` (percent) and
/// `memory_usage_mb` for the current process.
///
/// CPU usage needs two samples, so the first report carries `0.0`. Both figures
/// fall back to `0.0` where the platform gives nothing.
pub struct SystemStatusCollector {
    system: Mutex<System>,
    pid: Pid,
}

impl Default for SystemStatusCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemStatusCollector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    fn sample(&self) -> (f64, f64) {
        let mut system = self.system.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Status collector mutex poisoned");
            poisoned.into_inner()
        });
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        match system.process(self.pid) {
            Some(process) => {
                let cpu = f64::from(process.cpu_usage());
                let memory_mb = process.memory() as f64 / (1024.0 * 1024.0);
                (finite_or_zero(cpu), finite_or_zero(memory_mb))
            }
            None => {
                tracing::warn!(pid = %self.pid, "Process metrics unavailable");
                (0.0, 0.0)
            }
        }
    }
}

impl StatusCollector for SystemStatusCollector {
    fn collect_status(&self) -> Map<String, Value> {
        let (cpu_usage, memory_usage_mb) = self.sample();
        let mut status = Map::new();
        status.insert("timestamp".to_string(), json!(now_millis()));
        status.insert("status".to_string(), json!("running"));
        status.insert("cpu_usage".to_string(), json!(cpu_usage));
        status.insert("memory_usage_mb".to_string(), json!(memory_usage_mb));
        status
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

struct ReporterInner {
    channel: ChannelHandle,
    identity: ProcessIdentity,
    collector: RwLock<Arc<dyn StatusCollector>>,
    ticker: Mutex<Option<CancellationToken>>,
}

impl Drop for ReporterInner {
    fn drop(&mut self) {
        if let Some(ticker) = self
            .ticker
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            ticker.cancel();
        }
    }
}

/// Clonable handle; clones share the timer and collector.
#[derive(Clone)]
pub struct StatusReporter {
    inner: Arc<ReporterInner>,
}

impl StatusReporter {
    pub fn new(channel: ChannelHandle, identity: ProcessIdentity) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                channel,
                identity,
                collector: RwLock::new(Arc::new(SystemStatusCollector::new())),
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn set_collector(&self, collector: Arc<dyn StatusCollector>) {
        *self
            .inner
            .collector
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = collector;
    }

    fn collector(&self) -> Arc<dyn StatusCollector> {
        Arc::clone(
            &self
                .inner
                .collector
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    fn ticker(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.inner
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Report every `interval` until stopped. Restarts the timer if already running.
    ///
    /// Returns `false` for a zero interval or outside a tokio runtime.
    pub fn start_reporting(&self, interval: Duration) -> bool {
        if interval.is_zero() {
            tracing::warn!("Invalid status reporting interval, must be greater than zero");
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime, status reporting not started");
            return false;
        };

        let cancel = CancellationToken::new();
        if let Some(previous) = self.ticker().replace(cancel.clone()) {
            previous.cancel();
        }

        let weak = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                StatusReporter { inner }.report_on_tick().await;
            }
            tracing::trace!("Status reporting timer stopped");
        });

        tracing::debug!(interval_ms = interval.as_millis() as u64, "Status reporting started");
        true
    }

    pub fn stop_reporting(&self) {
        if let Some(ticker) = self.ticker().take() {
            ticker.cancel();
            tracing::debug!("Status reporting stopped");
        }
    }

    pub fn is_reporting(&self) -> bool {
        self.ticker()
            .as_ref()
            .is_some_and(|ticker| !ticker.is_cancelled())
    }

    /// Collect and send one report on the calling thread.
    ///
    /// Returns `false` if the channel is missing or not connected.
    pub fn report_status_now(&self) -> bool {
        if !self.inner.channel.is_connected() {
            return false;
        }
        let payload = self.collector().collect_status();
        self.send_status(payload)
    }

    /// Like [`report_status_now`](Self::report_status_now), but collects on
    /// the blocking pool so the calling task is not held up by sampling.
    pub async fn report_status_async(&self) -> bool {
        if !self.inner.channel.is_connected() {
            tracing::trace!("Channel not connected, skipping status report");
            return false;
        }
        let collector = self.collector();
        match tokio::task::spawn_blocking(move || collector.collect_status()).await {
            Ok(payload) => self.send_status(payload),
            Err(err) => {
                tracing::warn!(error = %err, "Status collection failed");
                false
            }
        }
    }

    async fn report_on_tick(&self) {
        self.report_status_async().await;
    }

    fn send_status(&self, payload: Map<String, Value>) -> bool {
        let Some(channel) = self.inner.channel.get() else {
            return false;
        };
        // The connection may have dropped while collecting.
        if !channel.is_connected() {
            return false;
        }
        let message = self
            .inner
            .identity
            .message(MessageType::StatusReport, STATUS_TOPIC)
            .with_body(payload);
        channel.send_message(message)
    }
}
