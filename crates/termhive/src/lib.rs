//! # termhive
//!
//! Persistent terminal sessions for a desktop host.
//!
//! ## Overview
//!
//! Every terminal surface in the host UI is identified by a caller-chosen
//! session id. termhive turns that id into a running shell:
//!
//! - **Local sessions** run inside tmux on a private per-session socket, so the
//!   shell survives UI reloads and reattaches by id.
//! - **Remote sessions** run over `ssh -tt`, using tmux on the remote host when
//!   it exists and a plain shell otherwise.
//! - **Scrollback** is kept per session and replayed once to each new owner.
//! - **Cleanup** sweeps orphaned tmux sessions left behind by earlier runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      SessionRegistry                         │
//! │   start / write / resize / kill / cleanup_all                │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────┐  │
//! │  │ LocalLauncher  │  │ RemoteLauncher │  │  Cleanup sweep │  │
//! │  │  (tmux / sh)   │  │ (ssh + script) │  │  (tmux ls/kill)│  │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────┘  │
//! │          └─────── LaunchPlan ┘                               │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────┐  │
//! │  │   PtyProcess   │─▶│     pump       │─▶│ SessionOutput  │  │
//! │  │ (I/O thread)   │  │ (exit teardown)│  │ (buffer+owner) │  │
//! │  └────────────────┘  └────────────────┘  └────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use termhive::session::{ClientHandle, SessionManager, SessionRegistry};
//! use termhive::{Config, StartRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let registry = SessionRegistry::new(config);
//!
//!     let (owner, mut events) = ClientHandle::new("window-1");
//!     let result = registry.start(StartRequest::new("ws-1"), owner).await;
//!     assert!(result.ok);
//!
//!     registry.write("ws-1", b"echo hello\n").await?;
//!     if let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!
//!     registry.kill("ws-1").await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, environment overrides and validation
//! - [`error`]: Error taxonomy shared by every module
//! - [`session`]: Launchers, PTY processes, fan-out, registry and cleanup

pub mod config;
pub mod error;
pub mod session;

// Re-export protocol types for convenience
pub use termhive_protocol::{
    CleanupReport, SessionEvent, SshConnectionSpec, StartRequest, StartResult, TransportKind,
};

pub use config::Config;
pub use error::{SessionError, SessionId};
pub use session::{ClientHandle, SessionManager, SessionRegistry};
