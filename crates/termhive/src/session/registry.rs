//! Session registry and I/O router.
//!
//! The registry maps caller-chosen session ids to live PTY processes. `start`
//! is idempotent per id: a live session is re-attached to the new owner with
//! its scrollback replayed, otherwise a local or remote launch plan is spawned.
//! Each session has an async pump that feeds PTY output into the fan-out and
//! tears the session down when the child exits. Explicit `kill` and observed
//! exit race through the session's [`LifecycleCell`]; only one of them tears
//! down.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use termhive_protocol::{CleanupReport, StartRequest, StartResult, TransportKind};
use tokio::sync::mpsc;

use super::fanout::{ClientHandle, ClientId, SessionOutput};
use super::lifecycle::LifecycleCell;
use super::local::LocalLauncher;
use super::pty::{LaunchPlan, ProgramSpec, PtyEvent, PtyProcess, TmuxTarget, Transport};
use super::remote::{RemoteLauncher, SshTarget};
use super::sweep::sweep_orphans;
use super::tmux::{detect_tmux, TmuxClient, TmuxControl, TmuxDetection};
use crate::config::Config;
use crate::error::{SessionError, SessionId};

/// Trait for session management operations.
///
/// Implementations must be thread-safe and tolerate every call against a
/// session that is being torn down.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Starts the session or re-attaches `owner` to the live one.
    async fn start(&self, request: StartRequest, owner: ClientHandle) -> StartResult;

    /// Writes input to a session. Unknown ids are ignored.
    async fn write(&self, session_id: &str, data: &[u8]) -> Result<(), SessionError>;

    /// Resizes a session's terminal. Failures are logged, not returned.
    async fn resize(&self, session_id: &str, cols: u16, rows: u16);

    /// Kills a session and its multiplexer session. Unknown ids are ignored.
    async fn kill(&self, session_id: &str);

    /// Reaps orphaned multiplexer sessions.
    async fn cleanup_all(&self) -> CleanupReport;

    /// Lists all live sessions.
    fn list(&self) -> Vec<SessionInfo>;

    /// Checks if a live session exists.
    fn exists(&self, session_id: &str) -> bool;

    /// Returns the number of live sessions.
    fn count(&self) -> usize;
}

/// Information about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Caller-chosen session identifier.
    pub id: SessionId,
    /// How the session reaches its shell.
    pub kind: TransportKind,
    /// Process ID of the PTY child (tmux client or ssh for multiplexed kinds).
    pub pid: Option<u32>,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Current owner, if bound.
    pub owner: Option<ClientId>,
    /// Bytes of scrollback held for replay.
    pub buffered_bytes: usize,
    /// tmux session name for multiplexed kinds.
    pub tmux_session: Option<String>,
}

/// Everything the registry keeps for one session.
struct SessionEntry {
    id: SessionId,
    transport: Transport,
    process: PtyProcess,
    output: SessionOutput,
    lifecycle: LifecycleCell,
}

impl SessionEntry {
    fn info(&self) -> SessionInfo {
        let (cols, rows) = self.process.size();
        SessionInfo {
            id: self.id.clone(),
            kind: self.transport.kind,
            pid: self.process.pid(),
            cols,
            rows,
            owner: self.output.owner_id(),
            buffered_bytes: self.output.buffered_bytes(),
            tmux_session: self
                .transport
                .tmux
                .as_ref()
                .map(|t| t.session_name.clone()),
        }
    }
}

type SessionMap = DashMap<SessionId, Arc<SessionEntry>>;

/// Removes `entry` from the map only if it is still the registered instance.
fn remove_entry(sessions: &SessionMap, entry: &Arc<SessionEntry>) {
    sessions.remove_if(&entry.id, |_, current| Arc::ptr_eq(current, entry));
}

/// Thread-safe session registry backed by a DashMap.
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    config: Config,
    tmux_detection: Option<TmuxDetection>,
    spawns: AtomicUsize,
}

impl SessionRegistry {
    /// Creates an empty registry. tmux is detected lazily on first use.
    pub fn new(config: Config) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config,
            tmux_detection: None,
            spawns: AtomicUsize::new(0),
        }
    }

    /// Uses `detection` instead of the process-wide probe.
    pub fn with_tmux_detection(mut self, detection: TmuxDetection) -> Self {
        self.tmux_detection = Some(detection);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The tmux detection this registry acts on.
    pub async fn tmux_detection(&self) -> TmuxDetection {
        match &self.tmux_detection {
            Some(detection) => detection.clone(),
            None => detect_tmux(&self.config.tmux).await.clone(),
        }
    }

    /// Number of PTY processes spawned over the registry's lifetime.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Current scrollback of a live session.
    pub fn history(&self, session_id: &str) -> Option<Vec<u8>> {
        self.live_entry(session_id).map(|e| e.output.history())
    }

    /// Snapshot of one live session.
    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.live_entry(session_id).map(|e| e.info())
    }

    fn live_entry(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .filter(|e| e.lifecycle.is_live())
    }

    /// Applies configured defaults to a request.
    fn program(&self, request: &StartRequest) -> ProgramSpec {
        let defaults = &self.config.session;
        ProgramSpec {
            shell: request
                .shell
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| defaults.default_shell.clone()),
            args: request.args.clone(),
            cwd: request.cwd.clone().filter(|c| !c.is_empty()),
            env: request.env.clone(),
            cols: request.cols.filter(|c| *c > 0).unwrap_or(defaults.default_cols),
            rows: request.rows.filter(|r| *r > 0).unwrap_or(defaults.default_rows),
        }
    }

    async fn plan(&self, request: &StartRequest) -> Result<LaunchPlan, SessionError> {
        let program = self.program(request);

        match &request.ssh {
            Some(spec) => {
                let target = SshTarget::resolve(spec)?;
                let launcher = RemoteLauncher::new(&self.config.ssh);
                if self.config.ssh.preflight {
                    launcher.preflight(&target).await?;
                }
                Ok(launcher.plan(&request.session_id, target, &program))
            }
            None => {
                let detection = self.tmux_detection().await;
                LocalLauncher::new(&self.config.tmux, &detection).plan(&request.session_id, &program)
            }
        }
    }

    /// Spawns the process and its I/O thread; the pump is started by the caller.
    fn spawn_entry(
        &self,
        session_id: &str,
        plan: LaunchPlan,
    ) -> Result<(Arc<SessionEntry>, mpsc::UnboundedReceiver<PtyEvent>), SessionError> {
        let process = PtyProcess::spawn(session_id, &plan)?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = process.start_io(tx) {
            let _ = process.terminate();
            return Err(e);
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let entry = Arc::new(SessionEntry {
            id: session_id.to_string(),
            transport: plan.transport,
            process,
            output: SessionOutput::new(session_id, self.config.session.scrollback_bytes),
            lifecycle: LifecycleCell::new(),
        });
        Ok((entry, rx))
    }

    /// Returns whether an existing session was reused.
    async fn try_start(&self, request: StartRequest, owner: ClientHandle) -> Result<bool, SessionError> {
        if let Some(existing) = self.live_entry(&request.session_id) {
            existing.output.bind(owner);
            tracing::info!(session_id = %request.session_id, "Reattached to live session");
            return Ok(true);
        }

        let plan = self.plan(&request).await?;

        let (entry, rx) = match self.sessions.entry(request.session_id.clone()) {
            Entry::Occupied(occupied) if occupied.get().lifecycle.is_live() => {
                // Another start won while this one was planning.
                let existing = Arc::clone(occupied.get());
                drop(occupied);
                existing.output.bind(owner);
                return Ok(true);
            }
            Entry::Occupied(mut occupied) => {
                let (entry, rx) = self.spawn_entry(&request.session_id, plan)?;
                occupied.insert(Arc::clone(&entry));
                (entry, rx)
            }
            Entry::Vacant(vacant) => {
                let (entry, rx) = self.spawn_entry(&request.session_id, plan)?;
                vacant.insert(Arc::clone(&entry));
                (entry, rx)
            }
        };

        entry.output.bind(owner);
        tokio::spawn(pump(Arc::clone(&self.sessions), Arc::clone(&entry), rx));

        tracing::info!(
            session_id = %entry.id,
            kind = ?entry.transport.kind,
            pid = ?entry.process.pid(),
            "Session started"
        );
        Ok(false)
    }

    /// Best-effort teardown of the multiplexer session behind `entry`.
    async fn kill_multiplexer(&self, entry: &SessionEntry) {
        let transport = &entry.transport;
        if !transport.kind.is_multiplexed() {
            return;
        }
        match (&transport.tmux, &transport.ssh) {
            (Some(tmux), Some(target)) if transport.kind.is_remote() => {
                let launcher = RemoteLauncher::new(&self.config.ssh);
                if let Err(e) = launcher.kill_remote_session(target, &entry.id).await {
                    tracing::debug!(
                        session_id = %entry.id,
                        tmux_session = %tmux.session_name,
                        error = %e,
                        "Remote kill-session failed"
                    );
                }
            }
            (Some(TmuxTarget { session_name, local: Some(local) }), _) => {
                let client = TmuxClient::new(&local.binary, self.config.tmux.command_timeout());
                match client.kill_session(&local.socket_path, session_name).await {
                    Ok(()) => {
                        if let Err(e) = std::fs::remove_file(&local.socket_path) {
                            tracing::debug!(session_id = %entry.id, error = %e, "Socket not removed");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(session_id = %entry.id, error = %e, "tmux kill-session failed");
                    }
                }
            }
            _ => {}
        }
    }

    /// Sockets of live local tmux sessions.
    fn live_sockets(&self) -> HashSet<PathBuf> {
        self.sessions
            .iter()
            .filter(|e| !e.value().transport.kind.is_remote())
            .filter_map(|e| {
                let local = e.value().transport.tmux.as_ref()?.local.as_ref()?;
                Some(local.socket_path.clone())
            })
            .collect()
    }
}

impl SessionManager for SessionRegistry {
    async fn start(&self, request: StartRequest, owner: ClientHandle) -> StartResult {
        let session_id = request.session_id.clone();
        match self.try_start(request, owner).await {
            Ok(true) => StartResult::reused(),
            Ok(false) => StartResult::spawned(),
            Err(e) => {
                tracing::warn!(session_id = %session_id, kind = e.kind(), error = %e, "Failed to start session");
                StartResult::failed(e.to_string())
            }
        }
    }

    async fn write(&self, session_id: &str, data: &[u8]) -> Result<(), SessionError> {
        let Some(entry) = self.live_entry(session_id) else {
            tracing::trace!(session_id = %session_id, "Write to unknown session ignored");
            return Ok(());
        };
        match entry.process.write(data).await {
            Err(SessionError::AlreadyTerminated(_)) => Ok(()),
            other => other,
        }
    }

    async fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        let Some(entry) = self.live_entry(session_id) else {
            return;
        };
        if let Err(e) = entry.process.resize(cols, rows).await {
            tracing::debug!(session_id = %session_id, error = %e, "Resize failed");
        }
    }

    async fn kill(&self, session_id: &str) {
        let Some(entry) = self.sessions.get(session_id).map(|e| Arc::clone(e.value())) else {
            tracing::debug!(session_id = %session_id, "Kill for unknown session ignored");
            return;
        };
        if !entry.lifecycle.begin_close() {
            tracing::debug!(session_id = %session_id, "Session already closing");
            return;
        }

        self.kill_multiplexer(&entry).await;
        if let Err(e) = entry.process.terminate() {
            tracing::debug!(session_id = %session_id, error = %e, "Terminate failed");
        }
        remove_entry(&self.sessions, &entry);
        entry.output.clear();
        entry.lifecycle.finish_close();

        tracing::info!(session_id = %session_id, "Session killed");
    }

    async fn cleanup_all(&self) -> CleanupReport {
        let detection = self.tmux_detection().await;
        let Some(binary) = detection.binary() else {
            return CleanupReport {
                success: false,
                cleaned: 0,
                errors: vec![detection
                    .error
                    .clone()
                    .unwrap_or_else(|| "tmux not available".to_string())],
            };
        };

        let client = TmuxClient::new(binary, self.config.tmux.command_timeout());
        sweep_orphans(&self.config.tmux.socket_dir(), &client, &self.live_sockets()).await
    }

    fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|e| e.value().lifecycle.is_live())
            .map(|e| e.value().info())
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    fn exists(&self, session_id: &str) -> bool {
        self.live_entry(session_id).is_some()
    }

    fn count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.value().lifecycle.is_live())
            .count()
    }
}

/// Feeds PTY output into the fan-out and tears the session down on exit.
async fn pump(
    sessions: Arc<SessionMap>,
    entry: Arc<SessionEntry>,
    mut rx: mpsc::UnboundedReceiver<PtyEvent>,
) {
    let mut exit = None;
    while let Some(event) = rx.recv().await {
        match event {
            PtyEvent::Output(chunk) => {
                if entry.lifecycle.is_live() {
                    entry.output.push(chunk);
                }
            }
            PtyEvent::Exited(info) => {
                exit = Some(info);
                break;
            }
        }
    }

    if !entry.lifecycle.begin_close() {
        tracing::debug!(session_id = %entry.id, "Exit observed after kill");
        return;
    }

    let info = exit.unwrap_or_default();
    let runtime_ms = u64::try_from(entry.process.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::info!(
        session_id = %entry.id,
        code = ?info.code,
        signal = ?info.signal,
        runtime_ms,
        "Session exited"
    );

    entry.output.notify_exit(info.code, info.signal, runtime_ms);
    remove_entry(&sessions, &entry);
    entry.output.clear();
    entry.lifecycle.finish_close();
}
