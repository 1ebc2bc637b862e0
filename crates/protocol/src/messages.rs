//! Control surface message definitions for termhive.
//!
//! These types cross the boundary between the session subsystem and the UI
//! glue layer. Requests flow in, results and [`SessionEvent`]s flow out. All
//! of them serialize to JSON for the front end.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Default SSH port used when a connection spec does not name one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How a session's process is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// A bare shell in a local PTY, no multiplexer.
    LocalDirect,
    /// A local tmux client attached to a persistent tmux session.
    LocalMultiplexed,
    /// An ssh client whose remote side runs inside tmux.
    RemoteMultiplexed,
    /// An ssh client running the remote shell directly.
    RemoteDirect,
}

impl TransportKind {
    /// Returns true when a tmux session backs this transport.
    pub fn is_multiplexed(self) -> bool {
        matches!(self, Self::LocalMultiplexed | Self::RemoteMultiplexed)
    }

    /// Returns true when the process runs on another host.
    pub fn is_remote(self) -> bool {
        matches!(self, Self::RemoteMultiplexed | Self::RemoteDirect)
    }
}

/// Where and how to reach a remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConnectionSpec {
    /// Remote host name or address.
    pub host: String,
    /// Login user.
    pub user: String,
    /// Working directory on the remote host. `~` expands to `$HOME`.
    #[serde(default)]
    pub remote_path: String,
    /// SSH port (default: 22).
    #[serde(default)]
    pub port: Option<u16>,
    /// Private key path. When absent the first common key under `~/.ssh` is used.
    #[serde(default)]
    pub key_path: Option<String>,
}

impl SshConnectionSpec {
    /// Creates a spec for `user@host` with default port and key.
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            remote_path: String::new(),
            port: None,
            key_path: None,
        }
    }

    /// Returns the configured port, falling back to 22.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }
}

/// Request to start (or re-attach to) a terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Caller-chosen identifier of the terminal surface.
    pub session_id: String,
    /// Working directory for the session.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Program to run (default: the configured shell).
    #[serde(default)]
    pub shell: Option<String>,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Requested terminal columns.
    #[serde(default)]
    pub cols: Option<u16>,
    /// Requested terminal rows.
    #[serde(default)]
    pub rows: Option<u16>,
    /// Run the session on a remote host instead of locally.
    #[serde(default)]
    pub ssh: Option<SshConnectionSpec>,
}

impl StartRequest {
    /// Creates a request with only the session id set.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: None,
            shell: None,
            args: Vec::new(),
            env: Vec::new(),
            cols: None,
            rows: None,
            ssh: None,
        }
    }
}

/// Outcome of a start request.
///
/// Failures are reported here rather than raised across the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResult {
    /// Whether the session is live after the call.
    pub ok: bool,
    /// Human-readable failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when an already-running session was re-attached.
    #[serde(default)]
    pub reused: bool,
}

impl StartResult {
    /// A freshly spawned session.
    pub fn spawned() -> Self {
        Self {
            ok: true,
            error: None,
            reused: false,
        }
    }

    /// An existing session that was re-attached.
    pub fn reused() -> Self {
        Self {
            ok: true,
            error: None,
            reused: true,
        }
    }

    /// A failed start.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            reused: false,
        }
    }
}

/// Aggregate result of the orphan-session sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// False only when the sweep could not run at all.
    pub success: bool,
    /// Number of tmux sessions killed.
    pub cleaned: usize,
    /// Per-socket failures.
    pub errors: Vec<String>,
}

/// Events delivered to the owner of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    /// Live output from the process.
    Data {
        /// Session the output belongs to.
        session_id: String,
        /// Raw output bytes.
        data: Vec<u8>,
    },
    /// Buffered output replayed once to a newly attached owner.
    History {
        /// Session the history belongs to.
        session_id: String,
        /// Concatenated scrollback.
        data: Vec<u8>,
    },
    /// The process exited on its own.
    Exit {
        /// Session that exited.
        session_id: String,
        /// Exit code if the process exited normally.
        code: Option<u32>,
        /// Signal name if the process was killed by a signal.
        signal: Option<String>,
        /// Milliseconds between spawn and exit.
        runtime_ms: u64,
    },
}

impl SessionEvent {
    /// Returns the id of the session this event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::Data { session_id, .. }
            | Self::History { session_id, .. }
            | Self::Exit { session_id, .. } => session_id,
        }
    }

    /// Serializes the event to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(ProtocolError::from)
    }

    /// Parses an event from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(ProtocolError::from)
    }
}
