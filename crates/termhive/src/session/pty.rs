//! PTY process management.
//!
//! A [`PtyProcess`] is one child running inside a pseudo-terminal. Launchers
//! describe what to run as a [`LaunchPlan`]; the process owns the master side,
//! the writer and a cloned killer, while a dedicated I/O thread reads output
//! until EOF and then reaps the child.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use termhive_protocol::TransportKind;
use tokio::sync::{mpsc, Mutex};

use super::remote::SshTarget;
use crate::error::{SessionError, SessionId};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// What the caller asked to run, with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    pub shell: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl ProgramSpec {
    /// Shell followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.shell.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// tmux coordinates of a multiplexed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxTarget {
    pub session_name: String,
    /// Server reachable from this host; `None` when tmux runs on the remote side.
    pub local: Option<LocalTmux>,
}

/// A tmux server on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTmux {
    pub socket_path: PathBuf,
    pub binary: PathBuf,
}

/// How a session reaches its shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    pub kind: TransportKind,
    pub tmux: Option<TmuxTarget>,
    pub ssh: Option<SshTarget>,
}

impl Transport {
    pub fn local_direct() -> Self {
        Self {
            kind: TransportKind::LocalDirect,
            tmux: None,
            ssh: None,
        }
    }
}

/// A fully resolved command line for the PTY child.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub transport: Transport,
}

impl LaunchPlan {
    fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.cwd(dir);
        }
        for key in &self.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// How the child ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, absent when killed by a signal or unknown.
    pub code: Option<u32>,
    /// Signal name, when the child was killed by one.
    pub signal: Option<String>,
}

/// Prefix `ExitStatus`'s `Display` uses for signalled children.
const SIGNAL_PREFIX: &str = "Terminated by ";

impl ExitInfo {
    /// Converts a reaped status. portable-pty reports signalled children with
    /// exit code 1 and only exposes the signal name through `Display`.
    pub fn from_status(status: &ExitStatus) -> Self {
        if status.success() {
            return Self {
                code: Some(0),
                signal: None,
            };
        }
        let rendered = status.to_string();
        match rendered.strip_prefix(SIGNAL_PREFIX) {
            Some(signal) => Self {
                code: None,
                signal: Some(signal.to_string()),
            },
            None => Self {
                code: Some(status.exit_code()),
                signal: None,
            },
        }
    }
}

/// Events produced by the I/O thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    Exited(ExitInfo),
}

type ChildParts = (Box<dyn Read + Send>, Box<dyn Child + Send + Sync>);

/// A child process attached to a pseudo-terminal.
pub struct PtyProcess {
    id: SessionId,

    /// The PTY master handle, used for resizing.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// The writer for the PTY.
    writer: Mutex<Box<dyn Write + Send>>,

    /// Kills the child without contending with the reaping thread.
    killer: std::sync::Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Reader and child, handed to the I/O thread by `start_io`.
    parts: std::sync::Mutex<Option<ChildParts>>,

    running: Arc<AtomicBool>,
    size: std::sync::Mutex<(u16, u16)>,
    pid: Option<u32>,
    started_at: Instant,
}

impl PtyProcess {
    /// Opens a PTY of the planned size and spawns the planned command in it.
    pub fn spawn(id: impl Into<SessionId>, plan: &LaunchPlan) -> Result<Self, SessionError> {
        let id = id.into();
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: plan.rows,
                cols: plan.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Process(format!("failed to open PTY: {e}")))?;

        let child = pair
            .slave
            .spawn_command(plan.command())
            .map_err(|e| {
                SessionError::Process(format!("failed to spawn {}: {e}", plan.program))
            })?;
        // The child holds its own copy; ours would keep the master from seeing EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Process(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Process(format!("failed to take PTY writer: {e}")))?;

        tracing::debug!(
            session_id = %id,
            program = %plan.program,
            pid = ?pid,
            kind = ?plan.transport.kind,
            "Spawned PTY child"
        );

        Ok(Self {
            id,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: std::sync::Mutex::new(killer),
            parts: std::sync::Mutex::new(Some((reader, child))),
            running: Arc::new(AtomicBool::new(true)),
            size: std::sync::Mutex::new((plan.cols, plan.rows)),
            pid,
            started_at: Instant::now(),
        })
    }

    /// Starts the I/O thread.
    ///
    /// Output chunks are sent as they arrive; once the PTY reaches EOF the
    /// child is reaped and a single `Exited` event is sent. Can only be called
    /// once.
    pub fn start_io(&self, tx: mpsc::UnboundedSender<PtyEvent>) -> Result<(), SessionError> {
        let (mut reader, mut child) = self
            .parts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| SessionError::Process(format!("I/O already started for {}", self.id)))?;

        let running = Arc::clone(&self.running);
        let session_id = self.id.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("pty-io-{}", self.id))
            .spawn(move || {
                let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => {
                            tracing::debug!(session_id = %session_id, "PTY EOF");
                            break;
                        }
                        Ok(n) => {
                            if tx.send(PtyEvent::Output(buffer[..n].to_vec())).is_err() {
                                tracing::trace!(session_id = %session_id, "Output receiver gone");
                                break;
                            }
                        }
                        Err(e) => {
                            // Linux reports EIO once the slave side is closed.
                            tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                            break;
                        }
                    }
                }
                running.store(false, Ordering::SeqCst);

                let info = match child.wait() {
                    Ok(status) => ExitInfo::from_status(&status),
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Failed to reap child");
                        ExitInfo::default()
                    }
                };
                tracing::info!(
                    session_id = %session_id,
                    code = ?info.code,
                    signal = ?info.signal,
                    "PTY child exited"
                );
                let _ = tx.send(PtyEvent::Exited(info));
            });
        spawned?;

        Ok(())
    }

    /// Returns the process ID of the child, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns whether the PTY is still producing output.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Time since spawn.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Writes data to the PTY (stdin).
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resizes the PTY to the given dimensions.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Process(format!("failed to resize PTY: {e}")))?;

        *self.size.lock().unwrap_or_else(|p| p.into_inner()) = (cols, rows);
        tracing::debug!(session_id = %self.id, cols, rows, "Resized PTY");
        Ok(())
    }

    /// Kills the child. The I/O thread still observes EOF and reports the exit.
    pub fn terminate(&self) -> Result<(), SessionError> {
        self.running.store(false, Ordering::SeqCst);
        let mut killer = self.killer.lock().unwrap_or_else(|p| p.into_inner());
        match killer.kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.raw_os_error() == Some(nix::libc::ESRCH) => Ok(()),
            Err(e) => Err(SessionError::Process(format!(
                "failed to kill {}: {e}",
                self.id
            ))),
        }
    }
}
