//! Log storage collaborator.
//!
//! The lifecycle accepts any [`LogStorage`] but never requires one. Workers use
//! it to persist structured entries; [`MemoryLogStorage`] is a bounded
//! in-process implementation that can archive to JSON lines.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum LogStorageError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize log entry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("log storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }

    /// Case-insensitive parse; unknown names map to `Info`.
    pub fn parse_lossy(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "TRACE" => Self::Trace,
            "DEBUG" => Self::Debug,
            "WARN" | "WARNING" => Self::Warning,
            "ERROR" => Self::Error,
            "FATAL" => Self::Fatal,
            _ => Self::Info,
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warning,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogCategory {
    #[default]
    System,
    Business,
    Performance,
    Security,
    Network,
    Database,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "log_id")]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub source_process: String,
    #[serde(default)]
    pub module_name: String,
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub line_number: u32,
    pub message: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub session_id: String,
}

impl LogEntry {
    pub fn new(
        level: LogLevel,
        category: LogCategory,
        source_process: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            level,
            category,
            source_process: source_process.into(),
            module_name: String::new(),
            function_name: String::new(),
            line_number: 0,
            message: message.into(),
            context: Map::new(),
            thread_id: format!("{:?}", std::thread::current().id()),
            session_id: String::new(),
        }
    }

    pub fn with_location(
        mut self,
        module_name: impl Into<String>,
        function_name: impl Into<String>,
        line_number: u32,
    ) -> Self {
        self.module_name = module_name.into();
        self.function_name = function_name.into();
        self.line_number = line_number;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn matches(&self, query: &LogQuery) -> bool {
        if query.start_time.is_some_and(|start| self.timestamp < start) {
            return false;
        }
        if query.end_time.is_some_and(|end| self.timestamp > end) {
            return false;
        }
        if !query.levels.is_empty() && !query.levels.contains(&self.level) {
            return false;
        }
        if !query.categories.is_empty() && !query.categories.contains(&self.category) {
            return false;
        }
        if !query.source_processes.is_empty()
            && !query.source_processes.contains(&self.source_process)
        {
            return false;
        }
        if !query.module_names.is_empty() && !query.module_names.contains(&self.module_name) {
            return false;
        }
        match &query.keyword {
            Some(keyword) => self.message.contains(keyword.as_str()),
            None => true,
        }
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] [{}] [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level.as_str(),
            self.source_process,
            self.message
        )
    }
}

/// Filter for [`LogStorage::query_logs`]. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub levels: Vec<LogLevel>,
    pub categories: Vec<LogCategory>,
    pub source_processes: Vec<String>,
    pub module_names: Vec<String>,
    pub keyword: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl LogQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn with_levels(mut self, levels: impl IntoIterator<Item = LogLevel>) -> Self {
        self.levels = levels.into_iter().collect();
        self
    }

    pub fn with_source_process(mut self, process: impl Into<String>) -> Self {
        self.source_processes.push(process.into());
        self
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogStatistics {
    pub total_count: usize,
    pub level_counts: BTreeMap<LogLevel, usize>,
    pub category_counts: BTreeMap<LogCategory, usize>,
    pub process_counts: BTreeMap<String, usize>,
    pub earliest_time: Option<DateTime<Utc>>,
    pub latest_time: Option<DateTime<Utc>>,
    pub total_size_bytes: u64,
}

impl LogStatistics {
    fn record(&mut self, entry: &LogEntry) {
        self.total_count += 1;
        *self.level_counts.entry(entry.level).or_default() += 1;
        *self.category_counts.entry(entry.category).or_default() += 1;
        *self
            .process_counts
            .entry(entry.source_process.clone())
            .or_default() += 1;
        if self.earliest_time.is_none_or(|t| entry.timestamp < t) {
            self.earliest_time = Some(entry.timestamp);
        }
        if self.latest_time.is_none_or(|t| entry.timestamp > t) {
            self.latest_time = Some(entry.timestamp);
        }
        self.total_size_bytes += serde_json::to_vec(entry).map_or(0, |bytes| bytes.len() as u64);
    }
}

/// Storage backend for structured log entries.
///
/// [`LogForwardLayer`](crate::log_forward::LogForwardLayer) may call back into
/// the storage from inside any `tracing` event, so implementations must not
/// emit events while holding a lock the write path also takes.
pub trait LogStorage: Send + Sync {
    fn write_log(&self, entry: LogEntry) -> Result<(), LogStorageError>;

    /// Returns how many entries were written.
    fn write_logs(&self, entries: Vec<LogEntry>) -> Result<usize, LogStorageError> {
        let mut written = 0;
        for entry in entries {
            self.write_log(entry)?;
            written += 1;
        }
        Ok(written)
    }

    /// Matching entries, oldest first, after `offset` and up to `limit`.
    fn query_logs(&self, query: &LogQuery) -> Vec<LogEntry>;

    /// Newest `count` entries, newest first. An empty `levels` matches all levels.
    fn latest_logs(&self, count: usize, levels: &[LogLevel]) -> Vec<LogEntry>;

    /// Newest `count` entries from one source process, newest first.
    fn process_logs(&self, process_id: &str, count: usize) -> Vec<LogEntry>;

    /// Drop entries older than `days_to_keep` days. Returns how many were removed.
    fn cleanup_old_logs(&self, days_to_keep: u32) -> usize;

    /// Write entries in `[start, end]` to `path` as JSON lines. Returns the count.
    fn archive_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        path: &Path,
    ) -> Result<usize, LogStorageError>;

    fn statistics(&self, query: &LogQuery) -> LogStatistics;

    fn is_healthy(&self) -> bool;

    fn flush(&self) -> Result<(), LogStorageError>;
}

pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

/// Ring buffer of the most recent entries.
pub struct MemoryLogStorage {
    entries: RwLock<VecDeque<LogEntry>>,
    capacity: usize,
}

impl Default for MemoryLogStorage {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryLogStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, VecDeque<LogEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, VecDeque<LogEntry>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn newest<F>(&self, count: usize, filter: F) -> Vec<LogEntry>
    where
        F: Fn(&LogEntry) -> bool,
    {
        self.read()
            .iter()
            .rev()
            .filter(|entry| filter(entry))
            .take(count)
            .cloned()
            .collect()
    }
}

impl LogStorage for MemoryLogStorage {
    fn write_log(&self, entry: LogEntry) -> Result<(), LogStorageError> {
        let mut entries = self.write();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }

    fn query_logs(&self, query: &LogQuery) -> Vec<LogEntry> {
        let entries = self.read();
        let matching = entries
            .iter()
            .filter(|entry| entry.matches(query))
            .skip(query.offset);
        match query.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }

    fn latest_logs(&self, count: usize, levels: &[LogLevel]) -> Vec<LogEntry> {
        self.newest(count, |entry| {
            levels.is_empty() || levels.contains(&entry.level)
        })
    }

    fn process_logs(&self, process_id: &str, count: usize) -> Vec<LogEntry> {
        self.newest(count, |entry| entry.source_process == process_id)
    }

    fn cleanup_old_logs(&self, days_to_keep: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days_to_keep));
        // The guard must be gone before logging: a forwarding layer may write
        // the event back into this storage.
        let removed = {
            let mut entries = self.write();
            let before = entries.len();
            entries.retain(|entry| entry.timestamp >= cutoff);
            before - entries.len()
        };
        if removed > 0 {
            tracing::debug!(removed, days_to_keep, "Cleaned up old log entries");
        }
        removed
    }

    fn archive_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        path: &Path,
    ) -> Result<usize, LogStorageError> {
        let selected = self.query_logs(&LogQuery::new().between(start, end));
        let io_err = |source: std::io::Error| LogStorageError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut buf = Vec::new();
        for entry in &selected {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = std::fs::File::create(path).map_err(io_err)?;
        file.write_all(&buf).map_err(io_err)?;
        file.flush().map_err(io_err)?;

        tracing::info!(count = selected.len(), path = %path.display(), "Archived log entries");
        Ok(selected.len())
    }

    fn statistics(&self, query: &LogQuery) -> LogStatistics {
        let mut stats = LogStatistics::default();
        for entry in self.read().iter().filter(|entry| entry.matches(query)) {
            stats.record(entry);
        }
        stats
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn flush(&self) -> Result<(), LogStorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(level: LogLevel, process: &str, message: &str) -> LogEntry {
        LogEntry::new(level, LogCategory::System, process, message)
    }

    fn seeded() -> MemoryLogStorage {
        let storage = MemoryLogStorage::new(100);
        storage
            .write_logs(vec![
                entry(LogLevel::Info, "agent", "started"),
                entry(LogLevel::Warning, "agent", "slow disk"),
                entry(LogLevel::Error, "other", "disk failed"),
                entry(LogLevel::Info, "other", "retrying"),
            ])
            .unwrap();
        storage
    }

    #[test]
    fn level_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [LogLevel::Trace, LogLevel::Warning, LogLevel::Fatal],
            @r#"
        [
          "TRACE",
          "WARNING",
          "FATAL"
        ]
        "#
        );
    }

    #[test]
    fn level_parse_is_lossy() {
        assert_eq!(LogLevel::parse_lossy("warn"), LogLevel::Warning);
        assert_eq!(LogLevel::parse_lossy("ERROR"), LogLevel::Error);
        assert_eq!(LogLevel::parse_lossy("verbose"), LogLevel::Info);
    }

    #[test]
    fn capacity_drops_oldest() {
        let storage = MemoryLogStorage::new(2);
        for message in ["a", "b", "c"] {
            storage.write_log(entry(LogLevel::Info, "p", message)).unwrap();
        }
        let all: Vec<String> = storage
            .query_logs(&LogQuery::new())
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(all, vec!["b", "c"]);
    }

    #[test]
    fn query_filters_and_pages() {
        let storage = seeded();

        let errors = storage.query_logs(&LogQuery::new().with_levels([LogLevel::Error]));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "disk failed");

        let disk = storage.query_logs(&LogQuery::new().with_keyword("disk"));
        assert_eq!(disk.len(), 2);

        let paged = storage.query_logs(&LogQuery::new().with_offset(1).with_limit(2));
        let messages: Vec<&str> = paged.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["slow disk", "disk failed"]);
    }

    #[test]
    fn latest_and_process_logs_are_newest_first() {
        let storage = seeded();
        let latest = storage.latest_logs(2, &[]);
        assert_eq!(latest[0].message, "retrying");
        assert_eq!(latest[1].message, "disk failed");

        let info = storage.latest_logs(10, &[LogLevel::Info]);
        assert_eq!(info.len(), 2);

        let agent = storage.process_logs("agent", 10);
        assert_eq!(agent.len(), 2);
        assert_eq!(agent[0].message, "slow disk");
    }

    #[test]
    fn cleanup_removes_old_entries() {
        let storage = MemoryLogStorage::new(10);
        let old = Utc::now() - Duration::days(10);
        storage
            .write_log(entry(LogLevel::Info, "p", "old").with_timestamp(old))
            .unwrap();
        storage.write_log(entry(LogLevel::Info, "p", "new")).unwrap();

        assert_eq!(storage.cleanup_old_logs(7), 1);
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.cleanup_old_logs(7), 0);
    }

    #[test]
    fn cleanup_logs_after_releasing_the_lock() {
        use crate::channel::ChannelHandle;
        use crate::log_forward::LogForwardLayer;
        use crate::ProcessIdentity;
        use std::sync::Arc;
        use tracing_subscriber::layer::SubscriberExt;

        let storage = Arc::new(MemoryLogStorage::new(10));
        storage
            .write_log(entry(LogLevel::Info, "p", "old").with_timestamp(Utc::now() - Duration::days(10)))
            .unwrap();
        let layer = LogForwardLayer::new(ChannelHandle::new(), ProcessIdentity::new("p", "p"))
            .with_min_level(tracing::Level::DEBUG)
            .with_storage(storage.clone());
        let subscriber = tracing_subscriber::registry().with(layer);

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let worker_storage = storage.clone();
        std::thread::spawn(move || {
            let removed = tracing::subscriber::with_default(subscriber, || {
                worker_storage.cleanup_old_logs(7)
            });
            let _ = done_tx.send(removed);
        });

        let removed = done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("cleanup_old_logs did not return");
        assert_eq!(removed, 1);
        // The cleanup event itself lands in the storage.
        let kept = storage.query_logs(&LogQuery::new());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].message, "Cleaned up old log entries");
    }

    #[test]
    fn statistics_count_by_level_and_process() {
        let stats = seeded().statistics(&LogQuery::new());
        assert_eq!(stats.total_count, 4);
        assert_eq!(stats.level_counts[&LogLevel::Info], 2);
        assert_eq!(stats.process_counts["other"], 2);
        assert!(stats.earliest_time <= stats.latest_time);
        assert!(stats.total_size_bytes > 0);

        let filtered = seeded().statistics(&LogQuery::new().with_source_process("agent"));
        assert_eq!(filtered.total_count, 2);
    }

    #[test]
    fn archive_writes_json_lines_in_range() {
        let storage = MemoryLogStorage::new(10);
        let now = Utc::now();
        storage
            .write_log(entry(LogLevel::Info, "p", "too old").with_timestamp(now - Duration::hours(2)))
            .unwrap();
        storage
            .write_log(entry(LogLevel::Info, "p", "in range").with_timestamp(now))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive").join("logs.jsonl");
        let count = storage
            .archive_logs(now - Duration::minutes(1), now + Duration::minutes(1), &path)
            .unwrap();
        assert_eq!(count, 1);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: LogEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.message, "in range");
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn entry_display_is_single_line() {
        let line = entry(LogLevel::Error, "agent", "boom").to_string();
        assert!(line.contains("[ERROR] [agent] boom"));
        assert!(!line.contains('\n'));
    }
}
