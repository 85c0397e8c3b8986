//! Status payload for the agent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};
use tether::status::{StatusCollector, SystemStatusCollector};
use tether::{ConfigStore, ProcessState};
use tokio::sync::watch;

use crate::analyzer::AnalysisStats;

/// Counters shared between the worker and its status collector.
#[derive(Debug, Default)]
pub struct AgentStats {
    pub commands_handled: AtomicU64,
    pub selected_ip: Mutex<Option<String>>,
    pub analysis: AnalysisStats,
}

impl AgentStats {
    pub fn selected_ip(&self) -> Option<String> {
        self.selected_ip
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn select_ip(&self, ip: &str) {
        *self
            .selected_ip
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ip.to_string());
    }
}

/// Host metrics plus `process_id`, `state`, the agent counters and the
/// configured `watch_directories`.
pub struct AgentStatusCollector {
    base: SystemStatusCollector,
    process_id: String,
    state: watch::Receiver<ProcessState>,
    config: Arc<ConfigStore>,
    stats: Arc<AgentStats>,
}

impl AgentStatusCollector {
    pub fn new(
        process_id: impl Into<String>,
        state: watch::Receiver<ProcessState>,
        config: Arc<ConfigStore>,
        stats: Arc<AgentStats>,
    ) -> Self {
        Self {
            base: SystemStatusCollector::new(),
            process_id: process_id.into(),
            state,
            config,
            stats,
        }
    }
}

impl StatusCollector for AgentStatusCollector {
    fn collect_status(&self) -> Map<String, Value> {
        let mut status = self.base.collect_status();
        status.insert("process_id".to_string(), json!(self.process_id));
        status.insert("state".to_string(), json!(self.state.borrow().as_str()));
        status.insert(
            "commands_handled".to_string(),
            json!(self.stats.commands_handled.load(Ordering::Relaxed)),
        );
        status.insert("selected_ip".to_string(), json!(self.stats.selected_ip()));
        self.stats.analysis.write_status(&mut status);
        status.insert(
            "watch_directories".to_string(),
            self.config.get_value("watch_directories", json!([])),
        );
        status
    }
}
