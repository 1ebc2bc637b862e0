//! Configuration management for termhive.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termhive/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding tmux binary discovery.
pub const ENV_TMUX_PATH: &str = "TERMHIVE_TMUX_PATH";

/// Environment variable that disables mandatory local tmux (diagnostic mode).
pub const ENV_ALLOW_NO_TMUX: &str = "TERMHIVE_ALLOW_NO_TMUX";

/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "TERMHIVE_LOG_LEVEL";

/// Default scrollback budget per session, in bytes.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 200_000;

/// Smallest accepted scrollback budget.
const MIN_SCROLLBACK_BYTES: usize = 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("default terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("scrollback_bytes must be at least 1024, got {0}")]
    InvalidScrollback(usize),

    #[error("{0} must be greater than 0")]
    InvalidTimeout(&'static str),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("host_key_checking must be one of: yes, no, accept-new; got {0}")]
    InvalidHostKeyChecking(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Accepted values for ssh's `StrictHostKeyChecking`. None of them prompt.
const VALID_HOST_KEY_CHECKING: &[&str] = &["yes", "no", "accept-new"];

/// Main configuration structure for termhive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Session defaults.
    pub session: SessionConfig,

    /// Local tmux settings.
    pub tmux: TmuxConfig,

    /// Remote session settings.
    pub ssh: SshConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for log files written while a terminal is in raw mode.
    pub log_dir: PathBuf,
}

/// Session defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Program used when a start request names none.
    pub default_shell: String,

    /// Terminal columns used when a start request names none.
    pub default_cols: u16,

    /// Terminal rows used when a start request names none.
    pub default_rows: u16,

    /// Scrollback budget per session, in bytes.
    pub scrollback_bytes: usize,

    /// Exits sooner than this after start are reported as a likely missing command.
    pub exit_grace_ms: u64,
}

/// Local tmux settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TmuxConfig {
    /// Explicit tmux binary, tried before the well-known locations.
    pub binary: Option<PathBuf>,

    /// Refuse to start local sessions without tmux.
    pub required: bool,

    /// Directory holding the tmux config and per-session sockets.
    pub socket_dir: Option<PathBuf>,

    /// Budget for each `tmux -V` probe, in milliseconds.
    pub probe_timeout_ms: u64,

    /// Budget for `list-sessions` / `kill-session`, in milliseconds.
    pub command_timeout_ms: u64,
}

/// Remote session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    /// ssh client binary.
    pub binary: String,

    /// Wrap remote sessions in tmux when the remote host has it.
    pub use_tmux: bool,

    /// Verify the connection with a batch-mode handshake before spawning.
    pub preflight: bool,

    /// Value for `StrictHostKeyChecking`.
    pub host_key_checking: String,

    /// Seconds between keep-alive probes.
    pub keepalive_interval_secs: u64,

    /// Unanswered keep-alive probes before disconnecting.
    pub keepalive_count_max: u32,

    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: default_log_dir(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_cols: 80,
            default_rows: 24,
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            exit_grace_ms: 1500,
        }
    }
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: None,
            required: true,
            socket_dir: None,
            probe_timeout_ms: 2000,
            command_timeout_ms: 5000,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            use_tmux: true,
            preflight: false,
            host_key_checking: "accept-new".to_string(),
            keepalive_interval_secs: 30,
            keepalive_count_max: 3,
            connect_timeout_secs: 10,
        }
    }
}

impl TmuxConfig {
    /// Returns the socket directory, falling back to a per-user temp directory.
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(default_socket_dir)
    }

    /// Budget for a single version probe.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Budget for a single tmux control command.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl SshConfig {
    /// Connection timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhive")
        .join("config.toml")
}

/// Returns the default log directory.
fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhive")
        .join("logs")
}

/// Returns the shared socket directory for this user.
fn default_socket_dir() -> PathBuf {
    std::env::temp_dir().join(format!("termhive-tmux-{}", nix::unistd::getuid()))
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Interprets an environment flag value.
fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMHIVE_TMUX_PATH: Override tmux binary discovery
    /// - TERMHIVE_ALLOW_NO_TMUX: Allow local sessions without tmux
    /// - TERMHIVE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ENV_TMUX_PATH) {
            if !path.is_empty() {
                tracing::info!("Overriding tmux binary from environment: {}", path);
                self.tmux.binary = Some(PathBuf::from(path));
            }
        }

        if let Ok(flag) = std::env::var(ENV_ALLOW_NO_TMUX) {
            if is_truthy(&flag) {
                tracing::warn!("Local tmux requirement disabled from environment");
                self.tmux.required = false;
            }
        }

        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.default_cols == 0 || session.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: session.default_cols,
                rows: session.default_rows,
            });
        }

        if session.scrollback_bytes < MIN_SCROLLBACK_BYTES {
            return Err(ConfigError::InvalidScrollback(session.scrollback_bytes));
        }

        if self.tmux.probe_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("probe_timeout_ms"));
        }
        if self.tmux.command_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("command_timeout_ms"));
        }
        if self.ssh.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("connect_timeout_secs"));
        }

        let shell_path = Path::new(&session.default_shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
            }
        } else if which::which(&session.default_shell).is_err() {
            return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        if !VALID_HOST_KEY_CHECKING.contains(&self.ssh.host_key_checking.as_str()) {
            return Err(ConfigError::InvalidHostKeyChecking(
                self.ssh.host_key_checking.clone(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
