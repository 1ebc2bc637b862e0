//! # termhive Protocol Library
//!
//! Control surface types shared between the termhive session subsystem and
//! the front end that drives it.
//!
//! ## Overview
//!
//! - **Requests**: [`StartRequest`] with an optional [`SshConnectionSpec`]
//! - **Results**: [`StartResult`] and [`CleanupReport`]
//! - **Events**: [`SessionEvent`] (`Data`, `History`, `Exit`) delivered to the
//!   single owner of a session
//!
//! ## Example Usage
//!
//! ```rust
//! use termhive_protocol::{SessionEvent, StartRequest};
//!
//! let mut request = StartRequest::new("ws-1");
//! request.cwd = Some("/tmp".to_string());
//! request.shell = Some("bash".to_string());
//!
//! let event = SessionEvent::Data {
//!     session_id: "ws-1".to_string(),
//!     data: b"$ ".to_vec(),
//! };
//! let json = event.to_json().unwrap();
//! assert!(json.contains("ws-1"));
//! ```

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    CleanupReport, SessionEvent, SshConnectionSpec, StartRequest, StartResult, TransportKind,
    DEFAULT_SSH_PORT,
};
