//! Bulk cleanup of orphaned tmux sessions.
//!
//! Walks the socket directory, kills every `termhive-*` session found on each
//! `th-*.sock` socket and removes the socket. Per-socket failures are
//! collected in the report and never abort the sweep.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use termhive_protocol::CleanupReport;

use super::naming::{is_session_name, is_socket_file};
use super::tmux::TmuxControl;
use crate::error::SessionError;

/// Socket files in `dir`, sorted.
fn socket_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut sockets: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_str().is_some_and(is_socket_file))
        .map(|entry| entry.path())
        .collect();
    sockets.sort();
    Ok(sockets)
}

/// Kills orphaned sessions under `socket_dir`, skipping sockets in `live`.
pub async fn sweep_orphans<C: TmuxControl>(
    socket_dir: &Path,
    control: &C,
    live: &HashSet<PathBuf>,
) -> CleanupReport {
    let mut report = CleanupReport {
        success: true,
        ..CleanupReport::default()
    };

    let sockets = match socket_files(socket_dir) {
        Ok(sockets) => sockets,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(dir = %socket_dir.display(), "Socket directory missing, nothing to clean");
            return report;
        }
        Err(e) => {
            report.success = false;
            report
                .errors
                .push(format!("{}: {e}", socket_dir.display()));
            return report;
        }
    };

    for socket in sockets {
        if live.contains(&socket) {
            tracing::debug!(socket = %socket.display(), "Skipping socket of live session");
            continue;
        }

        let sessions = match control.list_sessions(&socket).await {
            Ok(sessions) => sessions,
            Err(e) => {
                report.errors.push(format!("{}: {e}", socket.display()));
                // A slow server may still be alive; anything else means the socket is stale.
                if !matches!(e, SessionError::ProtocolTimeout(_)) {
                    remove_socket(&socket);
                }
                continue;
            }
        };

        let mut keep_socket = false;
        for name in sessions {
            if !is_session_name(&name) {
                keep_socket = true;
                continue;
            }
            match control.kill_session(&socket, &name).await {
                Ok(()) => {
                    report.cleaned += 1;
                    tracing::info!(socket = %socket.display(), session = %name, "Killed orphaned session");
                }
                Err(e) => {
                    keep_socket = true;
                    report
                        .errors
                        .push(format!("{} {name}: {e}", socket.display()));
                }
            }
        }

        if !keep_socket {
            remove_socket(&socket);
        }
    }

    tracing::info!(
        cleaned = report.cleaned,
        errors = report.errors.len(),
        "Cleanup sweep finished"
    );
    report
}

/// Removes a socket file; not-found and in-use failures are expected.
fn remove_socket(socket: &Path) {
    match std::fs::remove_file(socket) {
        Ok(()) => tracing::debug!(socket = %socket.display(), "Removed socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::debug!(socket = %socket.display(), error = %e, "Socket not removed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::naming::DerivedNames;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory stand-in for tmux.
    #[derive(Default)]
    struct FakeTmux {
        sessions: HashMap<PathBuf, Vec<String>>,
        failing_kills: HashSet<PathBuf>,
        killed: Mutex<Vec<String>>,
    }

    impl TmuxControl for FakeTmux {
        async fn list_sessions(&self, socket: &Path) -> Result<Vec<String>, SessionError> {
            self.sessions
                .get(socket)
                .cloned()
                .ok_or_else(|| SessionError::Process("no server running".to_string()))
        }

        async fn kill_session(&self, socket: &Path, name: &str) -> Result<(), SessionError> {
            if self.failing_kills.contains(socket) {
                return Err(SessionError::Process("can't find session".to_string()));
            }
            self.killed.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    /// Creates `count` socket files with one termhive session each.
    fn stale_sockets(dir: &TempDir, count: usize) -> (FakeTmux, Vec<PathBuf>) {
        let mut fake = FakeTmux::default();
        let mut sockets = Vec::new();
        for i in 0..count {
            let names = DerivedNames::for_session(&format!("stale-{i}"));
            let socket = dir.path().join(&names.socket_file);
            std::fs::write(&socket, "").unwrap();
            fake.sessions.insert(socket.clone(), vec![names.session_name]);
            sockets.push(socket);
        }
        (fake, sockets)
    }

    #[tokio::test]
    async fn test_three_stale_sockets() {
        let dir = TempDir::new().unwrap();
        let (fake, sockets) = stale_sockets(&dir, 3);

        let report = sweep_orphans(dir.path(), &fake, &HashSet::new()).await;

        assert!(report.success);
        assert_eq!(report.cleaned, 3);
        assert!(report.errors.is_empty());
        assert_eq!(fake.killed.lock().unwrap().len(), 3);
        assert!(sockets.iter().all(|s| !s.exists()));
    }

    #[tokio::test]
    async fn test_failed_kill_is_reported() {
        let dir = TempDir::new().unwrap();
        let (mut fake, sockets) = stale_sockets(&dir, 3);
        fake.failing_kills.insert(sockets[1].clone());

        let report = sweep_orphans(dir.path(), &fake, &HashSet::new()).await;

        assert!(report.success);
        assert_eq!(report.cleaned, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(sockets[1].exists());
    }

    #[tokio::test]
    async fn test_vanished_socket_is_reported() {
        let dir = TempDir::new().unwrap();
        let (mut fake, sockets) = stale_sockets(&dir, 3);
        fake.sessions.remove(&sockets[2]);

        let report = sweep_orphans(dir.path(), &fake, &HashSet::new()).await;

        assert!(report.success);
        assert!(report.cleaned < 3);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("no server running"));
    }

    #[tokio::test]
    async fn test_live_sockets_are_skipped() {
        let dir = TempDir::new().unwrap();
        let (fake, sockets) = stale_sockets(&dir, 2);
        let live: HashSet<PathBuf> = [sockets[0].clone()].into_iter().collect();

        let report = sweep_orphans(dir.path(), &fake, &live).await;

        assert_eq!(report.cleaned, 1);
        assert!(sockets[0].exists());
        assert!(!sockets[1].exists());
    }

    #[tokio::test]
    async fn test_foreign_files_and_sessions_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let (mut fake, sockets) = stale_sockets(&dir, 1);
        fake.sessions
            .get_mut(&sockets[0])
            .unwrap()
            .push("main".to_string());
        let other = dir.path().join("tmux.conf");
        std::fs::write(&other, "").unwrap();

        let report = sweep_orphans(dir.path(), &fake, &HashSet::new()).await;

        assert_eq!(report.cleaned, 1);
        assert_eq!(fake.killed.lock().unwrap().len(), 1);
        assert!(sockets[0].exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_success() {
        let dir = TempDir::new().unwrap();
        let fake = FakeTmux::default();
        let report = sweep_orphans(&dir.path().join("absent"), &fake, &HashSet::new()).await;

        assert!(report.success);
        assert_eq!(report.cleaned, 0);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_directory_fails() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, "").unwrap();
        let fake = FakeTmux::default();

        let report = sweep_orphans(&file, &fake, &HashSet::new()).await;
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
    }
}
