//! Session management module.
//!
//! This module provides PTY spawning, tmux-backed persistence, SSH remote
//! sessions and the registry that routes input and output by session id.

pub mod buffer;
pub mod fanout;
pub mod lifecycle;
pub mod local;
pub mod naming;
pub mod pty;
pub mod quote;
pub mod registry;
pub mod remote;
pub mod sweep;
pub mod tmux;

pub use buffer::ScrollbackBuffer;
pub use fanout::{ClientHandle, ClientId, SessionOutput};
pub use lifecycle::{Lifecycle, LifecycleCell};
pub use naming::DerivedNames;
pub use pty::{
    ExitInfo, LaunchPlan, LocalTmux, ProgramSpec, PtyEvent, PtyProcess, TmuxTarget, Transport,
};
pub use registry::{SessionInfo, SessionManager, SessionRegistry};
pub use remote::SshTarget;
pub use tmux::{detect_tmux, TmuxClient, TmuxControl, TmuxDetection, TmuxDetector};
