//! The agent's worker: channel setup and command handling.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tether::log_storage::LogLevel;
use tether::{
    ChannelConfig, LocalChannel, Message, MessageType, ProcessContext, Worker, WorkerError,
};
use tokio_util::sync::CancellationToken;

use crate::analyzer::{self, ANALYSIS_TOPIC, DEFAULT_MAX_FILE_SIZE_MB};
use crate::collector::{AgentStats, AgentStatusCollector};

pub const ERROR_TOPIC: &str = "error";

const DEFAULT_LOG_COUNT: usize = 50;

pub struct AgentWorker {
    shutdown: CancellationToken,
    stats: Arc<AgentStats>,
}

impl AgentWorker {
    /// `shutdown` is cancelled when the parent sends `Shutdown`.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            stats: Arc::new(AgentStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<AgentStats> {
        &self.stats
    }

    /// Build the reply to a `Command` message.
    async fn handle_command(&self, ctx: &ProcessContext, message: &Message) -> Message {
        self.stats.commands_handled.fetch_add(1, Ordering::Relaxed);
        let command = message.body_str("command").unwrap_or_default();
        tracing::debug!(%command, msg_id = %message.id, "Handling command");

        let result = match command {
            "ping" => Ok(json!("pong")),
            "report_status" => Ok(json!(ctx.status_reporter().report_status_async().await)),
            "get_config" => Ok(match message.body_str("key") {
                Some(key) => ctx.config().get_value(key, Value::Null),
                None => ctx.config().get_config(),
            }),
            "subscribe" | "unsubscribe" => self.change_subscription(ctx, command, message),
            "get_logs" => self.latest_logs(ctx, message),
            "analyze_file" => self.analyze_file(ctx, message).await,
            "select_ip" => self.select_ip(message),
            "" => Err("missing command".to_string()),
            other => Err(format!("unknown command: {other}")),
        };

        match result {
            Ok(result) => reply_to(
                message,
                ctx.message(MessageType::CommandResponse, &message.topic)
                    .with_field("command", command)
                    .with_field("request_id", message.id.as_str())
                    .with_field("result", result),
            ),
            Err(error) => {
                tracing::warn!(%command, %error, "Command failed");
                reply_to(message, self.error_report(ctx, &error, command))
            }
        }
    }

    fn change_subscription(
        &self,
        ctx: &ProcessContext,
        command: &str,
        message: &Message,
    ) -> Result<Value, String> {
        let topic = message
            .body_str("topic")
            .filter(|topic| !topic.is_empty())
            .ok_or_else(|| format!("{command} requires a topic"))?;
        let channel = ctx.channel().ok_or("no channel")?;
        let changed = if command == "subscribe" {
            channel.subscribe_to_topic(topic)
        } else {
            channel.unsubscribe_from_topic(topic)
        };
        Ok(json!({"topic": topic, "changed": changed, "topics": channel.subscribed_topics()}))
    }

    /// Runs on the blocking pool; also publishes the report on `analysis_report`.
    async fn analyze_file(&self, ctx: &ProcessContext, message: &Message) -> Result<Value, String> {
        let path = message
            .body_str("file_path")
            .filter(|path| !path.is_empty())
            .ok_or("analyze_file requires a file_path")?
            .to_string();
        let config = ctx.config();
        let overrides: Map<String, Value> = config.get_or("analysis_patterns", Map::new());
        let max_bytes = config
            .get_or("max_file_size_mb", DEFAULT_MAX_FILE_SIZE_MB)
            .saturating_mul(1024 * 1024);
        let stats = Arc::clone(&self.stats);

        let report = tokio::task::spawn_blocking(move || {
            let patterns = analyzer::compile_patterns(&overrides)?;
            analyzer::analyze_file(Path::new(&path), &patterns, max_bytes, &stats.analysis)
        })
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())?;

        ctx.send(
            ctx.message(MessageType::StatusReport, ANALYSIS_TOPIC)
                .with_body(report.clone()),
        );
        Ok(Value::Object(report))
    }

    fn select_ip(&self, message: &Message) -> Result<Value, String> {
        let ip = message
            .body_str("selected_ip")
            .filter(|ip| !ip.is_empty())
            .ok_or("select_ip requires a selected_ip")?;
        tracing::info!(%ip, "IP address selected");
        self.stats.select_ip(ip);
        Ok(json!({"selected_ip": ip}))
    }

    fn latest_logs(&self, ctx: &ProcessContext, message: &Message) -> Result<Value, String> {
        let storage = ctx.log_storage().ok_or("log storage not configured")?;
        let count = message
            .body
            .get("count")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_LOG_COUNT, |count| count as usize);
        let levels: Vec<LogLevel> = message
            .body_str("level")
            .map(LogLevel::parse_lossy)
            .into_iter()
            .collect();
        serde_json::to_value(storage.latest_logs(count, &levels)).map_err(|err| err.to_string())
    }

    fn error_report(&self, ctx: &ProcessContext, error: &str, context: &str) -> Message {
        ctx.message(MessageType::ErrorReport, ERROR_TOPIC)
            .with_field("error_message", error)
            .with_field("context", context)
            .with_field("process_state", ctx.state().as_str())
    }

    fn on_config_update(&self, ctx: &ProcessContext) {
        let config = ctx.config();
        if let Some(work_directory) = config
            .get::<String>("work_directory")
            .filter(|dir| !dir.is_empty())
        {
            tracing::info!(%work_directory, "Work directory updated");
        }
        let watch_directories: Vec<String> = config.get_or("watch_directories", Vec::new());
        tracing::debug!(?watch_directories, version = config.config_version(), "Configuration updated");
    }
}

fn reply_to(request: &Message, reply: Message) -> Message {
    if request.sender_id.is_empty() {
        reply
    } else {
        reply.with_receiver(request.sender_id.as_str())
    }
}

#[async_trait]
impl Worker for AgentWorker {
    async fn on_initialize(&self, ctx: &ProcessContext, _config: &Value) -> Result<(), WorkerError> {
        let ipc = ChannelConfig::from_json(&ctx.config().get_value("ipc", json!({})))?;
        tracing::debug!(server_name = %ipc.server_name, "Creating local channel");
        let channel = LocalChannel::local(ctx.identity().clone(), ipc)?;
        ctx.set_channel(Arc::new(channel));

        ctx.status_reporter()
            .set_collector(Arc::new(AgentStatusCollector::new(
                ctx.identity().process_id.as_str(),
                ctx.watch_state(),
                Arc::clone(ctx.config()),
                Arc::clone(&self.stats),
            )));
        Ok(())
    }

    async fn on_start(&self, ctx: &ProcessContext) -> Result<(), WorkerError> {
        let channel = ctx
            .channel()
            .ok_or_else(|| WorkerError::start("no channel injected"))?;
        channel.start()?;
        Ok(())
    }

    async fn on_stop(&self, ctx: &ProcessContext) {
        if let Some(channel) = ctx.channel() {
            channel.stop();
        }
    }

    async fn on_handle_message(&self, ctx: &ProcessContext, message: &Message) {
        match message.kind {
            MessageType::ConfigUpdate => self.on_config_update(ctx),
            MessageType::Command => {
                ctx.send(self.handle_command(ctx, message).await);
            }
            MessageType::Shutdown => {
                tracing::info!(sender = %message.sender_id, "Shutdown requested");
                self.shutdown.cancel();
            }
            MessageType::HelloAck => tracing::debug!("Parent acknowledged hello"),
            other => tracing::debug!(kind = %other, "Unhandled message type"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether::log_storage::{LogCategory, LogEntry, LogStorage, MemoryLogStorage};
    use tether::{ProcessIdentity, ProcessState, SubProcess};

    async fn agent() -> (SubProcess<AgentWorker>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let process = SubProcess::new(
            AgentWorker::new(shutdown.clone()),
            ProcessIdentity::new("agent-1", "agent"),
        );
        process
            .initialize(json!({
                "ipc": {"server_name": "/tmp/tether-agent-tests.sock"},
                "work_directory": "/srv/logs",
            }))
            .await
            .unwrap();
        (process, shutdown)
    }

    fn command(body: Value) -> Message {
        let Value::Object(body) = body else {
            panic!("command body must be an object");
        };
        Message::new(MessageType::Command, "commands")
            .with_sender("main_process")
            .with_body(body)
    }

    #[tokio::test]
    async fn initialize_injects_local_channel() {
        let (process, _) = agent().await;
        let channel = process.channel().unwrap();
        assert_eq!(channel.identity().process_id, "agent-1");
        assert_eq!(process.state(), ProcessState::Initialized);
    }

    #[tokio::test]
    async fn invalid_ipc_settings_fail_initialization() {
        let process = SubProcess::new(
            AgentWorker::new(CancellationToken::new()),
            ProcessIdentity::new("agent-1", "agent"),
        );
        let result = process
            .initialize(json!({"ipc": {"heartbeat_interval_ms": 0}}))
            .await;
        assert!(result.is_err());
        assert_eq!(process.state(), ProcessState::Error);
    }

    #[tokio::test]
    async fn ping_replies_pong() {
        let (process, _) = agent().await;
        let request = command(json!({"command": "ping"}));
        let reply = process
            .worker()
            .handle_command(process.context(), &request).await;

        assert_eq!(reply.kind, MessageType::CommandResponse);
        assert_eq!(reply.topic, "commands");
        assert_eq!(reply.sender_id, "agent-1");
        assert_eq!(reply.receiver_id, "main_process");
        assert_eq!(reply.body["command"], json!("ping"));
        assert_eq!(reply.body["result"], json!("pong"));
        assert_eq!(reply.body["request_id"], json!(request.id));
    }

    #[tokio::test]
    async fn get_config_reads_one_key_or_everything() {
        let (process, _) = agent().await;
        let worker = process.worker();

        let reply = worker.handle_command(
            process.context(),
            &command(json!({"command": "get_config", "key": "ipc.server_name"})),
        ).await;
        assert_eq!(reply.body["result"], json!("/tmp/tether-agent-tests.sock"));

        let reply = worker.handle_command(process.context(), &command(json!({"command": "get_config"}))).await;
        assert_eq!(reply.body["result"]["work_directory"], json!("/srv/logs"));
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_topics() {
        let (process, _) = agent().await;
        let worker = process.worker();
        let ctx = process.context();

        let reply = worker.handle_command(ctx, &command(json!({"command": "subscribe", "topic": "alerts"}))).await;
        assert_eq!(
            reply.body["result"],
            json!({"topic": "alerts", "changed": true, "topics": ["alerts"]})
        );

        let reply = worker.handle_command(ctx, &command(json!({"command": "subscribe", "topic": "alerts"}))).await;
        assert_eq!(reply.body["result"]["changed"], json!(false));

        let reply = worker.handle_command(ctx, &command(json!({"command": "unsubscribe", "topic": "alerts"}))).await;
        assert_eq!(
            reply.body["result"],
            json!({"topic": "alerts", "changed": true, "topics": []})
        );

        let reply = worker.handle_command(ctx, &command(json!({"command": "subscribe"}))).await;
        assert_eq!(reply.kind, MessageType::ErrorReport);
    }

    #[tokio::test]
    async fn unknown_command_sends_error_report() {
        let (process, _) = agent().await;
        let reply = process.worker().handle_command(
            process.context(),
            &command(json!({"command": "analyze_everything"})),
        ).await;

        assert_eq!(reply.kind, MessageType::ErrorReport);
        assert_eq!(reply.topic, ERROR_TOPIC);
        assert_eq!(reply.receiver_id, "main_process");
        assert_eq!(
            reply.body_str("error_message"),
            Some("unknown command: analyze_everything")
        );
        assert_eq!(reply.body_str("context"), Some("analyze_everything"));
        assert_eq!(reply.body_str("process_state"), Some("INITIALIZED"));
    }

    #[tokio::test]
    async fn get_logs_returns_newest_first() {
        let (process, _) = agent().await;
        let storage = Arc::new(MemoryLogStorage::new(16));
        for (level, text) in [(LogLevel::Info, "first"), (LogLevel::Error, "second"), (LogLevel::Info, "third")] {
            storage
                .write_log(LogEntry::new(level, LogCategory::System, "agent-1", text))
                .unwrap();
        }
        process.set_log_storage(storage);

        let reply = process.worker().handle_command(
            process.context(),
            &command(json!({"command": "get_logs", "count": 2})),
        ).await;
        let logs = reply.body["result"].as_array().unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0]["message"], json!("third"));
        assert_eq!(logs[1]["message"], json!("second"));

        let reply = process.worker().handle_command(
            process.context(),
            &command(json!({"command": "get_logs", "level": "error"})),
        ).await;
        let logs = reply.body["result"].as_array().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["level"], json!("ERROR"));
    }

    #[tokio::test]
    async fn get_logs_without_storage_is_an_error() {
        let (process, _) = agent().await;
        let reply = process
            .worker()
            .handle_command(process.context(), &command(json!({"command": "get_logs"}))).await;
        assert_eq!(reply.kind, MessageType::ErrorReport);
    }

    fn log_file(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("service.log");
        std::fs::write(&path, "INFO up\nERROR disk full\nrequest timed out\nERROR again\n").unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn analyze_file_matches_configured_patterns() {
        let (process, _) = agent().await;
        process
            .config()
            .load_from_json(&json!({"analysis_patterns": {"timeout": "timed out"}}))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = log_file(&dir);

        let reply = process
            .worker()
            .handle_command(
                process.context(),
                &command(json!({"command": "analyze_file", "file_path": path})),
            )
            .await;
        assert_eq!(reply.kind, MessageType::CommandResponse);
        let result = &reply.body["result"];
        assert_eq!(result["file_path"], json!(path));
        assert_eq!(result["pattern_matches"]["error"]["count"], json!(2));
        assert_eq!(result["pattern_matches"]["timeout"]["count"], json!(1));
        assert_eq!(
            result["pattern_matches"]["timeout"]["matches"][0],
            json!({"line_number": 3, "content": "request timed out"})
        );

        let mut status = Map::new();
        process.worker().stats().analysis.write_status(&mut status);
        assert_eq!(status["total_files_processed"], json!(1));
        assert_eq!(status["total_lines_analyzed"], json!(5));
        assert_eq!(status["total_errors_found"], json!(2));
    }

    #[tokio::test]
    async fn analyze_file_failures_send_error_reports() {
        let (process, _) = agent().await;
        let worker = process.worker();
        let ctx = process.context();

        let reply = worker
            .handle_command(ctx, &command(json!({"command": "analyze_file"})))
            .await;
        assert_eq!(reply.kind, MessageType::ErrorReport);
        assert_eq!(reply.body_str("error_message"), Some("analyze_file requires a file_path"));

        let reply = worker
            .handle_command(
                ctx,
                &command(json!({"command": "analyze_file", "file_path": "/nonexistent/app.log"})),
            )
            .await;
        assert_eq!(reply.kind, MessageType::ErrorReport);
        assert_eq!(
            reply.body_str("error_message"),
            Some("file not found: /nonexistent/app.log")
        );

        process
            .config()
            .load_from_json(&json!({"max_file_size_mb": 0}))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let reply = worker
            .handle_command(
                ctx,
                &command(json!({"command": "analyze_file", "file_path": log_file(&dir)})),
            )
            .await;
        assert_eq!(reply.kind, MessageType::ErrorReport);
        assert!(reply.body_str("error_message").unwrap().starts_with("file too large"));
        assert_eq!(worker.stats().analysis.files_processed(), 0);
    }

    #[tokio::test]
    async fn analysis_report_reaches_the_parent() {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("parent.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let process = SubProcess::new(
            AgentWorker::new(CancellationToken::new()),
            ProcessIdentity::new("agent-1", "agent"),
        );
        process
            .initialize(json!({"ipc": {"server_name": socket.display().to_string()}}))
            .await
            .unwrap();
        process.start().await.unwrap();

        let wait = std::time::Duration::from_secs(5);
        let (stream, _) = tokio::time::timeout(wait, listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut lines = BufReader::new(stream).lines();
        let hello = tokio::time::timeout(wait, lines.next_line()).await.unwrap().unwrap().unwrap();
        assert_eq!(Message::from_frame(hello.as_bytes()).unwrap().kind, MessageType::Hello);

        let path = log_file(&dir);
        process
            .handle_message(command(json!({"command": "analyze_file", "file_path": path})))
            .await;

        let report = loop {
            let line = tokio::time::timeout(wait, lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let message = Message::from_frame(line.as_bytes()).unwrap();
            if message.topic == ANALYSIS_TOPIC {
                break message;
            }
        };
        assert_eq!(report.kind, MessageType::StatusReport);
        assert_eq!(report.sender_id, "agent-1");
        assert_eq!(report.body["pattern_matches"]["error"]["count"], json!(2));
        process.stop().await;
    }

    #[tokio::test]
    async fn select_ip_records_the_selection() {
        let (process, _) = agent().await;
        let worker = process.worker();

        let reply = worker
            .handle_command(
                process.context(),
                &command(json!({"command": "select_ip", "selected_ip": "192.168.1.20"})),
            )
            .await;
        assert_eq!(reply.kind, MessageType::CommandResponse);
        assert_eq!(reply.body["result"], json!({"selected_ip": "192.168.1.20"}));
        assert_eq!(worker.stats().selected_ip().as_deref(), Some("192.168.1.20"));

        let reply = worker
            .handle_command(process.context(), &command(json!({"command": "select_ip"})))
            .await;
        assert_eq!(reply.kind, MessageType::ErrorReport);
        assert_eq!(worker.stats().selected_ip().as_deref(), Some("192.168.1.20"));
    }

    #[tokio::test]
    async fn shutdown_message_cancels_token() {
        let (process, shutdown) = agent().await;
        process
            .handle_message(Message::new(MessageType::Shutdown, "control"))
            .await;
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn commands_are_counted_in_status() {
        let (process, _) = agent().await;
        let worker = process.worker();
        worker.handle_command(process.context(), &command(json!({"command": "ping"}))).await;
        worker.handle_command(process.context(), &command(json!({"command": "nope"}))).await;
        assert_eq!(worker.stats().commands_handled.load(Ordering::Relaxed), 2);
    }
}
