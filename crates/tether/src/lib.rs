//! tether: lifecycle, IPC channel and hot-reload configuration for worker
//! sub-processes.
//!
//! A worker process implements [`Worker`] and is driven by [`SubProcess`]. The
//! parent is reached over a [`MessageChannel`], by default a [`LocalChannel`]
//! speaking newline-delimited JSON over a local socket.

mod version;

pub mod bridge;
pub mod channel;
pub mod config;
pub mod log_forward;
pub mod log_storage;
pub mod process;
pub mod state;
pub mod status;

pub use bridge::protocol::{Message, MessageType, ProcessIdentity};
pub use channel::{
    ChannelConfig, ChannelError, ChannelEvent, ChannelHandle, ChannelStats, IpcChannel,
    LocalChannel, MessageChannel, Transport,
};
pub use config::{ConfigChange, ConfigError, ConfigLoad, ConfigStore};
pub use log_forward::LogForwardLayer;
pub use log_storage::{LogEntry, LogLevel, LogQuery, LogStorage, MemoryLogStorage};
pub use process::{LifecycleError, ProcessContext, ProcessEvent, SubProcess, Worker, WorkerError};
pub use state::{ConnectionState, ProcessState};
pub use status::{StatusCollector, StatusReporter, SystemStatusCollector};
pub use version::{TETHER_VERSION, VersionInfo};
