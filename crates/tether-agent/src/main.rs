//! tether-agent: reference worker sub-process.
//!
//! Connects to the parent's local server, answers commands and reports status
//! until the parent sends `Shutdown` or the process is interrupted.

mod analyzer;
mod collector;
mod worker;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use serde_json::{Value, json};
use tether::log_storage::{DEFAULT_MEMORY_CAPACITY, MemoryLogStorage};
use tether::{ConfigStore, LogForwardLayer, ProcessIdentity, SubProcess, TETHER_VERSION};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::worker::AgentWorker;

const USAGE: &str = "\
Usage: tether-agent [--config <file>] [--server-name <name>] [--process-id <id>] [--name <name>]

Options:
  --config <file>        JSON configuration merged over the defaults
  --server-name <name>   Parent server name or socket path [default: master_ipc_server]
  --process-id <id>      Process id sent to the parent [default: generated]
  --name <name>          Process name [default: tether-agent]
  -h, --help             Print this help

Environment:
  TETHER_LOG   debug|info|warn|error [default: info]
  RUST_LOG     full filter directive, overrides TETHER_LOG
  LOG_FORMAT   json for JSON log lines";

#[derive(Debug, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    server_name: Option<String>,
    process_id: Option<String>,
    name: String,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(Some(args)) => args,
        Ok(None) => {
            println!("{USAGE}");
            return;
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// `Ok(None)` means help was requested.
fn parse_args(args: &[String]) -> Result<Option<Args>, String> {
    let mut parsed = Args {
        config: None,
        server_name: None,
        process_id: None,
        name: "tether-agent".to_string(),
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                parsed.config = Some(PathBuf::from(
                    args.get(i).ok_or("--config requires a value")?,
                ));
            }
            "--server-name" => {
                i += 1;
                parsed.server_name = Some(args.get(i).ok_or("--server-name requires a value")?.clone());
            }
            "--process-id" => {
                i += 1;
                parsed.process_id = Some(args.get(i).ok_or("--process-id requires a value")?.clone());
            }
            "--name" => {
                i += 1;
                parsed.name = args.get(i).ok_or("--name requires a value")?.clone();
            }
            "--help" | "-h" => return Ok(None),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Some(parsed))
}

fn run(args: Args) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(serve(args))
}

async fn serve(args: Args) -> anyhow::Result<()> {
    let identity = match &args.process_id {
        Some(id) => ProcessIdentity::new(id.as_str(), args.name.as_str()),
        None => ProcessIdentity::generated("agent", args.name.as_str()),
    }
    .with_version(env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => {
            let store = ConfigStore::new();
            store
                .load_from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            store.get_config()
        }
        None => json!({}),
    };
    if let Some(server_name) = &args.server_name {
        override_server_name(&mut config, server_name);
    }

    let shutdown = CancellationToken::new();
    let process = SubProcess::new(AgentWorker::new(shutdown.clone()), identity.clone());
    let storage = Arc::new(MemoryLogStorage::new(DEFAULT_MEMORY_CAPACITY));
    process.set_log_storage(storage.clone());

    init_tracing(
        LogForwardLayer::new(process.context().channel_handle().clone(), identity.clone())
            .with_storage(storage),
    );
    tracing::info!(
        process_id = %identity.process_id,
        version = TETHER_VERSION,
        "Starting agent"
    );

    process
        .initialize(config)
        .await
        .context("failed to initialize agent")?;
    process.start().await.context("failed to start agent")?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!("Interrupted, stopping");
        }
        _ = shutdown.cancelled() => {}
    }

    process.stop().await;
    let stats = process.worker().stats();
    tracing::info!(
        commands_handled = stats.commands_handled.load(Ordering::Relaxed),
        files_analyzed = stats.analysis.files_processed(),
        "Agent stopped"
    );
    Ok(())
}

/// Set `ipc.server_name`, replacing non-object values on the way.
fn override_server_name(config: &mut Value, server_name: &str) {
    if !config.is_object() {
        *config = json!({});
    }
    let ipc = &mut config["ipc"];
    if !ipc.is_object() {
        *ipc = json!({});
    }
    ipc["server_name"] = json!(server_name);
}

/// Initialize tracing with TETHER_LOG and LOG_FORMAT support.
fn init_tracing(forward: LogForwardLayer) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("TETHER_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "tether={level},tether_agent={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(forward);
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(forward);
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("tether-agent")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_all_flags() {
        let args = parse_args(&argv(&[
            "--config",
            "agent.json",
            "--server-name",
            "/run/parent.sock",
            "--process-id",
            "agent-7",
            "--name",
            "indexer",
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(
            args,
            Args {
                config: Some(PathBuf::from("agent.json")),
                server_name: Some("/run/parent.sock".to_string()),
                process_id: Some("agent-7".to_string()),
                name: "indexer".to_string(),
            }
        );
    }

    #[test]
    fn defaults_without_flags() {
        let args = parse_args(&argv(&[])).unwrap().unwrap();
        assert_eq!(args.name, "tether-agent");
        assert!(args.config.is_none());
    }

    #[test]
    fn help_and_errors() {
        assert_eq!(parse_args(&argv(&["--help"])).unwrap(), None);
        assert_eq!(
            parse_args(&argv(&["--config"])).unwrap_err(),
            "--config requires a value"
        );
        assert_eq!(
            parse_args(&argv(&["--verbose"])).unwrap_err(),
            "unknown flag: --verbose"
        );
        assert_eq!(
            parse_args(&argv(&["extra"])).unwrap_err(),
            "unexpected argument: extra"
        );
    }

    #[test]
    fn server_name_override_keeps_other_ipc_settings() {
        let mut config = json!({"ipc": {"heartbeat_interval_ms": 500}, "domain": true});
        override_server_name(&mut config, "/run/parent.sock");
        assert_eq!(
            config,
            json!({"ipc": {"heartbeat_interval_ms": 500, "server_name": "/run/parent.sock"}, "domain": true})
        );

        let mut config = json!({"ipc": "bogus"});
        override_server_name(&mut config, "parent");
        assert_eq!(config, json!({"ipc": {"server_name": "parent"}}));
    }
}
