//! tmux discovery and control.
//!
//! Discovery probes a fixed list of candidate binaries with `tmux -V` and
//! caches the first success for the lifetime of the process. Control commands
//! (`list-sessions`, `kill-session`) always target one private socket and run
//! under a timeout.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::config::TmuxConfig;
use crate::error::SessionError;

/// Install locations tried after an explicit override, in order.
pub const WELL_KNOWN_PATHS: &[&str] = &[
    "/opt/homebrew/bin/tmux",
    "/usr/local/bin/tmux",
    "/usr/bin/tmux",
    "/bin/tmux",
];

/// Lines of the minimal tmux configuration used for every session.
pub const CONFIG_LINES: &[&str] = &["set -g status off", "set -g mouse off"];

/// Result of probing for a tmux binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TmuxDetection {
    /// Whether a working tmux was found.
    pub available: bool,
    /// The binary that answered the probe.
    pub path: Option<PathBuf>,
    /// Output of `tmux -V`, e.g. `tmux 3.4`.
    pub version: Option<String>,
    /// Why no candidate worked.
    pub error: Option<String>,
}

impl TmuxDetection {
    /// A successful detection.
    pub fn found(path: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            available: true,
            path: Some(path.into()),
            version: Some(version.into()),
            error: None,
        }
    }

    /// A failed detection.
    pub fn missing(error: impl Into<String>) -> Self {
        Self {
            available: false,
            path: None,
            version: None,
            error: Some(error.into()),
        }
    }

    /// The usable binary, if any.
    pub fn binary(&self) -> Option<&Path> {
        if self.available {
            self.path.as_deref()
        } else {
            None
        }
    }

    /// Parses `(major, minor)` out of the version string.
    pub fn version_number(&self) -> Option<(u32, u32)> {
        self.version.as_deref().and_then(parse_version)
    }

    /// tmux 3.0 added `new-session -e`.
    pub fn supports_session_env(&self) -> bool {
        self.version_number().is_some_and(|v| v >= (3, 0))
    }
}

/// Parses strings like `tmux 3.3a` or `tmux next-3.5`.
fn parse_version(version: &str) -> Option<(u32, u32)> {
    let start = version.find(|c: char| c.is_ascii_digit())?;
    let numeric: String = version[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()
        .and_then(|m| m.parse().ok())
        .unwrap_or(0);
    Some((major, minor))
}

/// Probes candidate binaries in priority order.
#[derive(Debug, Clone)]
pub struct TmuxDetector {
    candidates: Vec<PathBuf>,
    timeout: Duration,
}

impl TmuxDetector {
    /// Builds the candidate list from configuration.
    ///
    /// Order: explicit override, well-known install prefixes, then `tmux`
    /// resolved on `PATH`.
    pub fn from_config(config: &TmuxConfig) -> Self {
        let mut candidates = Vec::new();
        if let Some(binary) = &config.binary {
            candidates.push(binary.clone());
        }
        candidates.extend(WELL_KNOWN_PATHS.iter().map(PathBuf::from));
        candidates.push(which::which("tmux").unwrap_or_else(|_| PathBuf::from("tmux")));

        let mut unique = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if !unique.contains(&candidate) {
                unique.push(candidate);
            }
        }

        Self::with_candidates(unique, config.probe_timeout())
    }

    /// Uses an explicit candidate list.
    pub fn with_candidates(candidates: Vec<PathBuf>, timeout: Duration) -> Self {
        Self {
            candidates,
            timeout,
        }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// Runs the probes. The first candidate that answers wins.
    pub async fn detect(&self) -> TmuxDetection {
        let mut failures = Vec::new();

        for candidate in &self.candidates {
            match probe_version(candidate, self.timeout).await {
                Ok(version) => {
                    tracing::info!(
                        path = %candidate.display(),
                        version = %version,
                        "Found tmux"
                    );
                    return TmuxDetection::found(candidate.clone(), version);
                }
                Err(e) => {
                    tracing::trace!(path = %candidate.display(), error = %e, "tmux candidate rejected");
                    failures.push(format!("{}: {e}", candidate.display()));
                }
            }
        }

        tracing::warn!(candidates = self.candidates.len(), "tmux not found");
        TmuxDetection::missing(format!("tmux not found ({})", failures.join("; ")))
    }
}

/// Runs `<path> -V` under `timeout`.
async fn probe_version(path: &Path, timeout: Duration) -> Result<String, SessionError> {
    let mut cmd = Command::new(path);
    cmd.arg("-V")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(SessionError::Process(e.to_string())),
        Err(_) => {
            return Err(SessionError::ProtocolTimeout(format!(
                "version probe exceeded {}ms",
                timeout.as_millis()
            )))
        }
    };

    if !output.status.success() {
        return Err(SessionError::Process(format!(
            "version probe exited with {}",
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

static DETECTION: OnceCell<TmuxDetection> = OnceCell::const_new();

/// Returns the process-wide tmux detection, probing on first use.
///
/// The first caller's configuration decides the candidate list; the result is
/// never invalidated.
pub async fn detect_tmux(config: &TmuxConfig) -> &'static TmuxDetection {
    DETECTION
        .get_or_init(|| async { TmuxDetector::from_config(config).detect().await })
        .await
}

/// Session-level tmux operations on a private socket.
#[allow(async_fn_in_trait)]
pub trait TmuxControl {
    /// Lists session names served on `socket`.
    async fn list_sessions(&self, socket: &Path) -> Result<Vec<String>, SessionError>;

    /// Kills the session named exactly `name` on `socket`.
    async fn kill_session(&self, socket: &Path, name: &str) -> Result<(), SessionError>;
}

/// Runs tmux control commands with a timeout.
#[derive(Debug, Clone)]
pub struct TmuxClient {
    binary: PathBuf,
    timeout: Duration,
}

impl TmuxClient {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, socket: &Path, args: &[&str]) -> Result<Output, SessionError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-S")
            .arg(socket)
            .args(args)
            .env_remove("TMUX")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(SessionError::Process(format!(
                "failed to run {}: {e}",
                self.binary.display()
            ))),
            Err(_) => Err(SessionError::ProtocolTimeout(format!(
                "tmux {} on {} exceeded {}ms",
                args.first().copied().unwrap_or_default(),
                socket.display(),
                self.timeout.as_millis()
            ))),
        }
    }
}

fn failure(command: &str, output: &Output) -> SessionError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        SessionError::Process(format!("tmux {command} exited with {}", output.status))
    } else {
        SessionError::Process(format!("tmux {command}: {stderr}"))
    }
}

impl TmuxControl for TmuxClient {
    async fn list_sessions(&self, socket: &Path) -> Result<Vec<String>, SessionError> {
        let output = self
            .run(socket, &["list-sessions", "-F", "#{session_name}"])
            .await?;
        if !output.status.success() {
            return Err(failure("list-sessions", &output));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn kill_session(&self, socket: &Path, name: &str) -> Result<(), SessionError> {
        let target = format!("={name}");
        let output = self.run(socket, &["kill-session", "-t", &target]).await?;
        if !output.status.success() {
            return Err(failure("kill-session", &output));
        }
        tracing::debug!(socket = %socket.display(), session = %name, "tmux session killed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Writes an executable shell script and returns its path.
    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("tmux 3.4"), Some((3, 4)));
        assert_eq!(parse_version("tmux 3.3a"), Some((3, 3)));
        assert_eq!(parse_version("tmux next-3.5"), Some((3, 5)));
        assert_eq!(parse_version("tmux 2.9"), Some((2, 9)));
        assert_eq!(parse_version("tmux 3"), Some((3, 0)));
        assert_eq!(parse_version("tmux master"), None);
    }

    #[test]
    fn test_supports_session_env() {
        assert!(TmuxDetection::found("/usr/bin/tmux", "tmux 3.2a").supports_session_env());
        assert!(!TmuxDetection::found("/usr/bin/tmux", "tmux 2.8").supports_session_env());
        assert!(!TmuxDetection::found("/usr/bin/tmux", "tmux master").supports_session_env());
        assert!(!TmuxDetection::missing("nope").supports_session_env());
    }

    #[test]
    fn test_binary_requires_availability() {
        let found = TmuxDetection::found("/usr/bin/tmux", "tmux 3.4");
        assert_eq!(found.binary(), Some(Path::new("/usr/bin/tmux")));
        assert_eq!(TmuxDetection::missing("nope").binary(), None);
    }

    #[test]
    fn test_candidate_order() {
        let config = TmuxConfig {
            binary: Some(PathBuf::from("/custom/tmux")),
            ..TmuxConfig::default()
        };
        let detector = TmuxDetector::from_config(&config);
        let candidates = detector.candidates();

        assert_eq!(candidates[0], PathBuf::from("/custom/tmux"));
        assert_eq!(candidates[1], PathBuf::from("/opt/homebrew/bin/tmux"));
        assert!(candidates.len() >= WELL_KNOWN_PATHS.len() + 1);
    }

    #[test]
    fn test_candidates_are_unique() {
        let config = TmuxConfig {
            binary: Some(PathBuf::from("/usr/bin/tmux")),
            ..TmuxConfig::default()
        };
        let detector = TmuxDetector::from_config(&config);
        let count = detector
            .candidates()
            .iter()
            .filter(|c| c.as_path() == Path::new("/usr/bin/tmux"))
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_detect_nothing_found() {
        let detector = TmuxDetector::with_candidates(
            vec![PathBuf::from("/nonexistent/tmux")],
            Duration::from_millis(500),
        );
        let detection = detector.detect().await;
        assert!(!detection.available);
        assert!(detection.path.is_none());
        assert!(detection.error.unwrap().contains("/nonexistent/tmux"));
    }

    #[tokio::test]
    #[serial]
    async fn test_detect_first_success_wins() {
        let dir = TempDir::new().unwrap();
        let first = script(&dir, "tmux-a", "echo 'tmux 3.1'");
        let second = script(&dir, "tmux-b", "echo 'tmux 3.4'");

        let detector = TmuxDetector::with_candidates(
            vec![PathBuf::from("/nonexistent/tmux"), first.clone(), second],
            Duration::from_secs(2),
        );
        let detection = detector.detect().await;

        assert!(detection.available);
        assert_eq!(detection.path, Some(first));
        assert_eq!(detection.version.as_deref(), Some("tmux 3.1"));
        assert!(detection.error.is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_detect_rejects_failing_probe() {
        let dir = TempDir::new().unwrap();
        let broken = script(&dir, "tmux-broken", "exit 1");

        let detector = TmuxDetector::with_candidates(vec![broken], Duration::from_secs(2));
        let detection = detector.detect().await;
        assert!(!detection.available);
    }

    #[tokio::test]
    #[serial]
    async fn test_probe_timeout() {
        let dir = TempDir::new().unwrap();
        let slow = script(&dir, "tmux-slow", "exec sleep 5");

        let result = probe_version(&slow, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(SessionError::ProtocolTimeout(_))));
    }

    #[tokio::test]
    #[serial]
    async fn test_client_list_sessions() {
        let dir = TempDir::new().unwrap();
        let fake = script(
            &dir,
            "tmux",
            r#"[ "$3" = "list-sessions" ] || exit 2
printf 'termhive-abc-ws-1\nmain\n\n'"#,
        );

        let client = TmuxClient::new(fake, Duration::from_secs(2));
        let sessions = client
            .list_sessions(Path::new("/tmp/th-0.sock"))
            .await
            .unwrap();
        assert_eq!(sessions, vec!["termhive-abc-ws-1", "main"]);
    }

    #[tokio::test]
    #[serial]
    async fn test_client_kill_session_uses_exact_target() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("args.log");
        let fake = script(
            &dir,
            "tmux",
            &format!("printf '%s\\n' \"$@\" > '{}'", log.display()),
        );

        let client = TmuxClient::new(fake, Duration::from_secs(2));
        client
            .kill_session(Path::new("/tmp/th-1.sock"), "termhive-x")
            .await
            .unwrap();

        let args = std::fs::read_to_string(&log).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(
            args,
            vec!["-S", "/tmp/th-1.sock", "kill-session", "-t", "=termhive-x"]
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_client_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let fake = script(&dir, "tmux", "echo 'no server running' >&2; exit 1");

        let client = TmuxClient::new(fake, Duration::from_secs(2));
        let err = client
            .list_sessions(Path::new("/tmp/th-2.sock"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no server running"));
    }
}
