//! Local session launcher.
//!
//! Local sessions run inside tmux on a private per-session socket so they
//! survive the PTY client going away. Without tmux they fail unless the
//! configuration explicitly allows direct shells.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use termhive_protocol::TransportKind;

use super::naming::{DerivedNames, CONFIG_FILE_NAME};
use super::pty::{LaunchPlan, LocalTmux, ProgramSpec, TmuxTarget, Transport};
use super::quote;
use super::tmux::{TmuxDetection, CONFIG_LINES};
use crate::config::{TmuxConfig, ENV_ALLOW_NO_TMUX};
use crate::error::SessionError;

/// Variables that would make tmux think it is nested.
const NESTING_VARS: &[&str] = &["TMUX", "TMUX_PANE"];

/// Terminal variables set unless the caller overrides them.
const DEFAULT_TERMINAL_ENV: &[(&str, &str)] =
    &[("TERM", "xterm-256color"), ("COLORTERM", "truecolor")];

/// Contents of the tmux configuration file.
pub fn config_contents() -> String {
    let mut contents = CONFIG_LINES.join("\n");
    contents.push('\n');
    contents
}

/// Creates the socket directory with mode 0700.
pub fn ensure_socket_dir(dir: &Path) -> Result<(), SessionError> {
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

/// Writes the tmux configuration into `dir`, skipping identical contents.
pub fn ensure_config_file(dir: &Path) -> Result<PathBuf, SessionError> {
    let path = dir.join(CONFIG_FILE_NAME);
    let contents = config_contents();
    match fs::read_to_string(&path) {
        Ok(existing) if existing == contents => {}
        _ => {
            fs::write(&path, &contents)?;
            tracing::debug!(path = %path.display(), "Wrote tmux config");
        }
    }
    Ok(path)
}

/// Caller env plus terminal defaults the caller did not set.
pub(crate) fn with_terminal_defaults(env: &[(String, String)]) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = DEFAULT_TERMINAL_ENV
        .iter()
        .filter(|(key, _)| !env.iter().any(|(k, _)| k == key))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    merged.extend(env.iter().cloned());
    merged
}

/// Builds launch plans for local sessions.
pub struct LocalLauncher<'a> {
    config: &'a TmuxConfig,
    detection: &'a TmuxDetection,
}

impl<'a> LocalLauncher<'a> {
    pub fn new(config: &'a TmuxConfig, detection: &'a TmuxDetection) -> Self {
        Self { config, detection }
    }

    /// Chooses tmux when available, direct when allowed, otherwise fails.
    pub fn plan(&self, session_id: &str, program: &ProgramSpec) -> Result<LaunchPlan, SessionError> {
        if let Some(binary) = self.detection.binary() {
            return self.tmux_plan(session_id, program, binary);
        }

        let reason = self
            .detection
            .error
            .clone()
            .unwrap_or_else(|| "tmux not found".to_string());
        if self.config.required {
            return Err(SessionError::Configuration(format!(
                "local sessions require tmux ({reason}); set {ENV_ALLOW_NO_TMUX}=1 to run shells directly"
            )));
        }

        tracing::warn!(
            session_id = %session_id,
            reason = %reason,
            "tmux unavailable, starting local shell without persistence"
        );
        Ok(self.direct_plan(program))
    }

    fn tmux_plan(
        &self,
        session_id: &str,
        program: &ProgramSpec,
        binary: &Path,
    ) -> Result<LaunchPlan, SessionError> {
        let socket_dir = self.config.socket_dir();
        ensure_socket_dir(&socket_dir)?;
        let config_path = ensure_config_file(&socket_dir)?;

        let names = DerivedNames::for_session(session_id);
        let socket_path = socket_dir.join(&names.socket_file);

        let mut args: Vec<String> = vec![
            "-u".into(),
            "-S".into(),
            socket_path.display().to_string(),
            "-f".into(),
            config_path.display().to_string(),
            "new-session".into(),
            "-A".into(),
            "-s".into(),
            names.session_name.clone(),
        ];
        if let Some(cwd) = &program.cwd {
            args.push("-c".into());
            args.push(cwd.clone());
        }
        args.extend([
            "-x".into(),
            program.cols.to_string(),
            "-y".into(),
            program.rows.to_string(),
        ]);
        if self.detection.supports_session_env() {
            for (key, value) in &program.env {
                args.push("-e".into());
                args.push(format!("{key}={value}"));
            }
        }
        // tmux hands a single argument to the shell, so quote it as one command line.
        args.push(quote::join(&program.argv()));

        tracing::debug!(
            session_id = %session_id,
            tmux_session = %names.session_name,
            socket = %socket_path.display(),
            "Planned local tmux session"
        );

        Ok(LaunchPlan {
            program: binary.display().to_string(),
            args,
            cwd: program.cwd.as_ref().map(PathBuf::from),
            env: with_terminal_defaults(&program.env),
            env_remove: NESTING_VARS.iter().map(|v| v.to_string()).collect(),
            cols: program.cols,
            rows: program.rows,
            transport: Transport {
                kind: TransportKind::LocalMultiplexed,
                tmux: Some(TmuxTarget {
                    session_name: names.session_name,
                    local: Some(LocalTmux {
                        socket_path,
                        binary: binary.to_path_buf(),
                    }),
                }),
                ssh: None,
            },
        })
    }

    fn direct_plan(&self, program: &ProgramSpec) -> LaunchPlan {
        LaunchPlan {
            program: program.shell.clone(),
            args: program.args.clone(),
            cwd: program.cwd.as_ref().map(PathBuf::from),
            env: with_terminal_defaults(&program.env),
            env_remove: NESTING_VARS.iter().map(|v| v.to_string()).collect(),
            cols: program.cols,
            rows: program.rows,
            transport: Transport::local_direct(),
        }
    }
}
