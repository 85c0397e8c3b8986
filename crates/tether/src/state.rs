//! State machines for the sub-process and its parent connection.

use serde::{Deserialize, Serialize};

/// Life-cycle state of a sub-process.
///
/// Owned by [`SubProcess`](crate::process::SubProcess); only one value exists at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    #[default]
    NotInitialized,
    /// Configuration loaded, worker setup in progress
    Initializing,
    Initialized,
    Running,
    Stopping,
    Stopped,
    /// Initialization, start or a mid-run fault failed. Only external
    /// re-initialization (a fresh process) recovers from here.
    Error,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::Initializing => "INITIALIZING",
            Self::Initialized => "INITIALIZED",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the channel to the parent process.
///
/// `Disconnected` is reachable from every state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Transport connect in flight
    Connecting,
    Connected,
    Initialized,
    Authenticated,
    /// Last connect or I/O attempt failed; reconnect is pending if enabled
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Initialized => "INITIALIZED",
            Self::Authenticated => "AUTHENTICATED",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
