//! Error types for the session subsystem.

use thiserror::Error;

/// Unique identifier for a session, chosen by the caller.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A required binary or key is missing, or the configuration forbids the request.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// SSH handshake or authentication failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Filesystem or socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Spawning or signalling a process failed.
    #[error("process error: {0}")]
    Process(String),

    /// A bounded subprocess call exceeded its budget.
    #[error("timed out: {0}")]
    ProtocolTimeout(String),

    /// The session has already been terminated.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),
}

impl SessionError {
    /// Returns a stable short name for the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Connection(_) => "connection",
            Self::Io(_) => "io",
            Self::Process(_) => "process",
            Self::ProtocolTimeout(_) => "timeout",
            Self::AlreadyTerminated(_) => "terminated",
        }
    }
}
