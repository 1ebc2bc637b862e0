//! Remote (SSH) session launcher.
//!
//! A remote session is one `ssh -tt` process whose command argument is a small
//! POSIX script. The script reuses the local naming scheme on the remote host:
//! when tmux exists there it creates or attaches the session on a private
//! socket, otherwise it execs the shell directly in the remote path.
//!
//! Three boundaries are quoted independently: the tmux shell-command, the
//! script line that runs tmux, and the outer `/bin/sh -c <script>` argument
//! that the remote login shell parses.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use termhive_protocol::{SshConnectionSpec, TransportKind};
use tokio::process::Command;

use super::local::with_terminal_defaults;
use super::naming::{DerivedNames, CONFIG_FILE_NAME};
use super::pty::{LaunchPlan, ProgramSpec, TmuxTarget, Transport};
use super::quote::{self, Word};
use super::tmux::CONFIG_LINES;
use crate::config::SshConfig;
use crate::error::SessionError;

/// Key files tried under `~/.ssh`, in order.
pub const DEFAULT_KEY_NAMES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa", "id_dsa"];

/// Assignment of `$d`, the remote socket directory.
const REMOTE_SOCKET_DIR: &str = r#"d="${TMPDIR:-/tmp}/termhive-tmux-$(id -u)""#;

/// Test for a remote tmux.
const HAS_TMUX: &str = "command -v tmux >/dev/null 2>&1";

/// Extra time allowed for a one-shot ssh call beyond its connect timeout.
const ONE_SHOT_SLACK: Duration = Duration::from_secs(5);

/// Exit status ssh uses for its own failures.
const SSH_FAILURE_STATUS: i32 = 255;

/// Returns the existing default key files in `ssh_dir`.
pub fn discover_keys(ssh_dir: &Path) -> Vec<PathBuf> {
    DEFAULT_KEY_NAMES
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.is_file())
        .collect()
}

fn default_ssh_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
}

/// Expands a leading `~` in a local path.
fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None if path == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// A resolved SSH destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_path: PathBuf,
    pub remote_path: String,
}

impl SshTarget {
    /// Resolves the key against `~/.ssh`.
    pub fn resolve(spec: &SshConnectionSpec) -> Result<Self, SessionError> {
        Self::resolve_in(spec, &default_ssh_dir())
    }

    /// Resolves the key against `ssh_dir`.
    ///
    /// An explicit key must exist; otherwise the first default key found is
    /// used. Failures list the keys that could have been used instead.
    pub fn resolve_in(spec: &SshConnectionSpec, ssh_dir: &Path) -> Result<Self, SessionError> {
        if spec.host.is_empty() {
            return Err(SessionError::Configuration("ssh host is empty".to_string()));
        }

        let available = discover_keys(ssh_dir);
        let key_path = match &spec.key_path {
            Some(key) => {
                let path = expand_home(key);
                if !path.is_file() {
                    return Err(SessionError::Configuration(format!(
                        "ssh key not found: {} ({})",
                        path.display(),
                        describe_keys(&available, ssh_dir)
                    )));
                }
                path
            }
            None => available.first().cloned().ok_or_else(|| {
                SessionError::Configuration(format!(
                    "no ssh key found ({})",
                    describe_keys(&available, ssh_dir)
                ))
            })?,
        };

        Ok(Self {
            host: spec.host.clone(),
            user: spec.user.clone(),
            port: spec.port_or_default(),
            key_path,
            remote_path: spec.remote_path.clone(),
        })
    }

    /// `user@host`, or just `host` without a user.
    pub fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

fn describe_keys(available: &[PathBuf], ssh_dir: &Path) -> String {
    if available.is_empty() {
        format!(
            "no keys in {}; tried {}",
            ssh_dir.display(),
            DEFAULT_KEY_NAMES.join(", ")
        )
    } else {
        let keys: Vec<String> = available.iter().map(|p| p.display().to_string()).collect();
        format!("available keys: {}", keys.join(", "))
    }
}

/// The remote path as a shell word; `~` and `~/…` expand to `$HOME`.
fn remote_path_word(path: &str) -> Word {
    let home = "\"$HOME\"".to_string();
    if path.is_empty() || path == "~" {
        Word::Expr(home)
    } else if let Some(rest) = path.strip_prefix("~/") {
        Word::Joined(format!("{home}/"), rest.to_string())
    } else {
        Word::lit(path)
    }
}

/// A path inside the remote socket directory.
fn in_socket_dir(file: &str) -> Word {
    Word::Joined("\"$d\"/".to_string(), file.to_string())
}

/// Builds the remote session script.
pub fn session_script(
    names: &DerivedNames,
    remote_path: &str,
    argv: &[String],
    use_tmux: bool,
) -> String {
    let path = remote_path_word(remote_path);

    let mut direct = vec![Word::lit("cd"), path.clone(), Word::expr("&&"), Word::lit("exec")];
    direct.extend(argv.iter().map(Word::lit));
    let direct = quote::render(&direct);

    if !use_tmux {
        return direct;
    }

    let mut write_config = vec![Word::lit("printf"), Word::lit("%s\\n")];
    write_config.extend(CONFIG_LINES.iter().map(|line| Word::lit(*line)));
    write_config.push(Word::expr(">"));
    write_config.push(in_socket_dir(CONFIG_FILE_NAME));

    let attach = quote::render(&[
        Word::lit("exec"),
        Word::lit("tmux"),
        Word::lit("-u"),
        Word::lit("-S"),
        in_socket_dir(&names.socket_file),
        Word::lit("-f"),
        in_socket_dir(CONFIG_FILE_NAME),
        Word::lit("new-session"),
        Word::lit("-A"),
        Word::lit("-s"),
        Word::lit(names.session_name.as_str()),
        Word::lit("-c"),
        path,
        Word::lit(quote::join(argv)),
    ]);

    [
        REMOTE_SOCKET_DIR.to_string(),
        format!("if {HAS_TMUX}; then"),
        r#"mkdir -p "$d" && chmod 700 "$d""#.to_string(),
        quote::render(&write_config),
        attach,
        "fi".to_string(),
        direct,
    ]
    .join("\n")
}

/// Builds the remote teardown script.
pub fn kill_script(names: &DerivedNames) -> String {
    let kill = quote::render(&[
        Word::lit("tmux"),
        Word::lit("-S"),
        in_socket_dir(&names.socket_file),
        Word::lit("kill-session"),
        Word::lit("-t"),
        Word::lit(format!("={}", names.session_name)),
    ]);
    [
        REMOTE_SOCKET_DIR.to_string(),
        format!("{HAS_TMUX} || exit 0"),
        format!("{kill} 2>/dev/null || true"),
    ]
    .join("\n")
}

/// Wraps a script as the single command argument given to ssh.
pub fn remote_command(script: &str) -> String {
    quote::render(&[Word::lit("exec"), Word::lit("/bin/sh"), Word::lit("-c"), Word::lit(script)])
}

/// Builds ssh invocations from configuration.
pub struct RemoteLauncher<'a> {
    config: &'a SshConfig,
}

impl<'a> RemoteLauncher<'a> {
    pub fn new(config: &'a SshConfig) -> Self {
        Self { config }
    }

    /// ssh options and destination, without the remote command.
    pub fn ssh_args(&self, target: &SshTarget, interactive: bool) -> Vec<String> {
        let mut args = vec![if interactive { "-tt" } else { "-T" }.to_string()];
        args.extend([
            "-p".to_string(),
            target.port.to_string(),
            "-i".to_string(),
            target.key_path.display().to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", self.config.host_key_checking),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.config.keepalive_interval_secs),
            "-o".to_string(),
            format!("ServerAliveCountMax={}", self.config.keepalive_count_max),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ]);
        if !interactive {
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        args.push(target.destination());
        args
    }

    /// Plans the interactive ssh process for a session.
    pub fn plan(&self, session_id: &str, target: SshTarget, program: &ProgramSpec) -> LaunchPlan {
        let names = DerivedNames::for_session(session_id);
        let use_tmux = self.config.use_tmux;
        let script = session_script(&names, &target.remote_path, &program.argv(), use_tmux);

        let mut args = self.ssh_args(&target, true);
        args.push(remote_command(&script));

        tracing::debug!(
            session_id = %session_id,
            destination = %target.destination(),
            port = target.port,
            use_tmux,
            "Planned remote session"
        );

        let tmux = use_tmux.then(|| TmuxTarget {
            session_name: names.session_name.clone(),
            local: None,
        });

        LaunchPlan {
            program: self.config.binary.clone(),
            args,
            cwd: None,
            env: with_terminal_defaults(&program.env),
            env_remove: Vec::new(),
            cols: program.cols,
            rows: program.rows,
            transport: Transport {
                kind: if use_tmux {
                    TransportKind::RemoteMultiplexed
                } else {
                    TransportKind::RemoteDirect
                },
                tmux,
                ssh: Some(target),
            },
        }
    }

    fn one_shot_timeout(&self) -> Duration {
        self.config.connect_timeout() + ONE_SHOT_SLACK
    }

    async fn one_shot(&self, target: &SshTarget, command: &str) -> Result<(), SessionError> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.ssh_args(target, false))
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = self.one_shot_timeout();
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SessionError::Process(format!(
                    "failed to run {}: {e}",
                    self.config.binary
                )))
            }
            Err(_) => {
                return Err(SessionError::ProtocolTimeout(format!(
                    "ssh to {} exceeded {}s",
                    target.destination(),
                    timeout.as_secs()
                )))
            }
        };

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let reason = if stderr.is_empty() {
            format!("ssh exited with {}", output.status)
        } else {
            stderr
        };
        if output.status.code() == Some(SSH_FAILURE_STATUS) {
            Err(SessionError::Connection(format!(
                "{}: {reason}",
                target.destination()
            )))
        } else {
            Err(SessionError::Connection(format!(
                "{}: remote command failed: {reason}",
                target.destination()
            )))
        }
    }

    /// Checks that ssh can connect and authenticate non-interactively.
    pub async fn preflight(&self, target: &SshTarget) -> Result<(), SessionError> {
        self.one_shot(target, "true").await?;
        tracing::debug!(destination = %target.destination(), "ssh preflight succeeded");
        Ok(())
    }

    /// Kills the remote tmux session for `session_id`.
    pub async fn kill_remote_session(
        &self,
        target: &SshTarget,
        session_id: &str,
    ) -> Result<(), SessionError> {
        let names = DerivedNames::for_session(session_id);
        self.one_shot(target, &remote_command(&kill_script(&names)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn target(dir: &TempDir) -> SshTarget {
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, "key").unwrap();
        SshTarget {
            host: "example.com".to_string(),
            user: "dev".to_string(),
            port: 2222,
            key_path: key,
            remote_path: "~/work".to_string(),
        }
    }

    fn program() -> ProgramSpec {
        ProgramSpec {
            shell: "bash".to_string(),
            args: vec![],
            cwd: None,
            env: vec![],
            cols: 80,
            rows: 24,
        }
    }

    fn lines(output: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(output)
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_discover_keys_in_preference_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("id_rsa"), "").unwrap();
        std::fs::write(dir.path().join("id_ed25519"), "").unwrap();

        let keys = discover_keys(dir.path());
        assert_eq!(
            keys,
            vec![dir.path().join("id_ed25519"), dir.path().join("id_rsa")]
        );
    }

    #[test]
    fn test_resolve_defaults_to_first_key() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("id_ecdsa"), "").unwrap();

        let mut spec = SshConnectionSpec::new("dev", "example.com");
        spec.remote_path = "/srv".to_string();
        let target = SshTarget::resolve_in(&spec, dir.path()).unwrap();

        assert_eq!(target.key_path, dir.path().join("id_ecdsa"));
        assert_eq!(target.port, 22);
        assert_eq!(target.destination(), "dev@example.com");
        assert_eq!(target.remote_path, "/srv");
    }

    #[test]
    fn test_resolve_missing_key_lists_available() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("id_rsa"), "").unwrap();

        let mut spec = SshConnectionSpec::new("dev", "example.com");
        spec.key_path = Some(dir.path().join("missing").display().to_string());
        let err = SshTarget::resolve_in(&spec, dir.path()).unwrap_err();

        assert!(matches!(err, SessionError::Configuration(_)));
        let message = err.to_string();
        assert!(message.contains("missing"));
        assert!(message.contains("id_rsa"));
    }

    #[test]
    fn test_resolve_without_any_key() {
        let dir = TempDir::new().unwrap();
        let spec = SshConnectionSpec::new("dev", "example.com");
        let err = SshTarget::resolve_in(&spec, dir.path()).unwrap_err();
        assert!(err.to_string().contains("id_ed25519"));
    }

    #[test]
    fn test_destination_without_user() {
        let dir = TempDir::new().unwrap();
        let mut target = target(&dir);
        target.user = String::new();
        assert_eq!(target.destination(), "example.com");
    }

    #[test]
    fn test_remote_path_words() {
        assert_eq!(quote::render(&[remote_path_word("")]), "\"$HOME\"");
        assert_eq!(quote::render(&[remote_path_word("~")]), "\"$HOME\"");
        assert_eq!(
            quote::render(&[remote_path_word("~/my dir")]),
            "\"$HOME\"/'my dir'"
        );
        assert_eq!(quote::render(&[remote_path_word("/srv/app")]), "'/srv/app'");
    }

    #[test]
    fn test_ssh_args() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);
        let config = SshConfig::default();
        let args = RemoteLauncher::new(&config).ssh_args(&target, true);

        assert_eq!(args[0], "-tt");
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.contains(&"IdentitiesOnly=yes".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=accept-new".to_string()));
        assert!(args.contains(&"ServerAliveInterval=30".to_string()));
        assert!(!args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args.last().unwrap(), "dev@example.com");

        let batch = RemoteLauncher::new(&config).ssh_args(&target, false);
        assert_eq!(batch[0], "-T");
        assert!(batch.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn test_plan_kinds() {
        let dir = TempDir::new().unwrap();
        let config = SshConfig::default();
        let plan = RemoteLauncher::new(&config).plan("ws-r", target(&dir), &program());
        assert_eq!(plan.program, "ssh");
        assert_eq!(plan.transport.kind, TransportKind::RemoteMultiplexed);
        let tmux = plan.transport.tmux.as_ref().unwrap();
        assert_eq!(tmux.session_name, DerivedNames::for_session("ws-r").session_name);
        assert!(tmux.local.is_none());
        assert!(plan.args.last().unwrap().starts_with("'exec' '/bin/sh' '-c'"));

        let config = SshConfig {
            use_tmux: false,
            ..SshConfig::default()
        };
        let plan = RemoteLauncher::new(&config).plan("ws-r", target(&dir), &program());
        assert_eq!(plan.transport.kind, TransportKind::RemoteDirect);
        assert!(plan.transport.tmux.is_none());
        assert!(!plan.args.last().unwrap().contains("tmux"));
    }

    #[test]
    fn test_plan_sets_terminal_defaults() {
        let dir = TempDir::new().unwrap();
        let config = SshConfig::default();
        let plan = RemoteLauncher::new(&config).plan("ws-term", target(&dir), &program());
        assert!(plan
            .env
            .contains(&("TERM".to_string(), "xterm-256color".to_string())));

        let mut custom = program();
        custom.env = vec![("TERM".to_string(), "screen".to_string())];
        let plan = RemoteLauncher::new(&config).plan("ws-term", target(&dir), &custom);
        let terms: Vec<_> = plan.env.iter().filter(|(k, _)| k == "TERM").collect();
        assert_eq!(terms, vec![&("TERM".to_string(), "screen".to_string())]);
    }

    #[test]
    fn test_fallback_branch_runs_shell_in_tricky_path() {
        let dir = TempDir::new().unwrap();
        let workdir = dir.path().join("it's a $(dir) `x`");
        std::fs::create_dir(&workdir).unwrap();
        let empty_bin = dir.path().join("empty-bin");
        std::fs::create_dir(&empty_bin).unwrap();

        let names = DerivedNames::for_session("ws-fallback");
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "pwd; printf '%s\\n' \"$0\"".to_string(),
            "arg with 'quotes' $HOME".to_string(),
        ];
        let script = session_script(&names, &workdir.display().to_string(), &argv, true);

        let output = StdCommand::new("/bin/sh")
            .arg("-c")
            .arg(remote_command(&script))
            .env("PATH", &empty_bin)
            .output()
            .unwrap();

        assert!(output.status.success(), "{:?}", output);
        assert_eq!(
            lines(&output.stdout),
            vec![
                workdir.display().to_string(),
                "arg with 'quotes' $HOME".to_string()
            ]
        );
    }

    #[test]
    #[serial]
    fn test_tmux_branch_receives_exact_arguments() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let fake = bin.join("tmux");
        std::fs::write(&fake, "#!/bin/sh\nprintf '%s\\n' \"$@\"\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tmpdir = dir.path().join("tmp");
        std::fs::create_dir(&tmpdir).unwrap();
        let workdir = dir.path().join("proj dir");
        std::fs::create_dir(&workdir).unwrap();

        let names = DerivedNames::for_session("ws-remote");
        let argv = vec!["bash".to_string(), "-c".to_string(), "echo 'hi' \"$X\"".to_string()];
        let script = session_script(&names, &workdir.display().to_string(), &argv, true);

        let output = StdCommand::new("/bin/sh")
            .arg("-c")
            .arg(remote_command(&script))
            .env("PATH", format!("{}:/usr/bin:/bin", bin.display()))
            .env("TMPDIR", &tmpdir)
            .output()
            .unwrap();
        assert!(output.status.success(), "{:?}", output);

        let uid = nix::unistd::getuid();
        let socket_dir = tmpdir.join(format!("termhive-tmux-{uid}"));
        assert_eq!(
            lines(&output.stdout),
            vec![
                "-u".to_string(),
                "-S".to_string(),
                socket_dir.join(&names.socket_file).display().to_string(),
                "-f".to_string(),
                socket_dir.join(CONFIG_FILE_NAME).display().to_string(),
                "new-session".to_string(),
                "-A".to_string(),
                "-s".to_string(),
                names.session_name.clone(),
                "-c".to_string(),
                workdir.display().to_string(),
                quote::join(&argv),
            ]
        );
        assert_eq!(
            std::fs::read_to_string(socket_dir.join(CONFIG_FILE_NAME)).unwrap(),
            "set -g status off\nset -g mouse off\n"
        );
        let mode = std::fs::metadata(&socket_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn test_direct_script_expands_home() {
        let names = DerivedNames::for_session("ws-home");
        let script = session_script(&names, "~", &["sh".to_string()], false);
        assert_eq!(script, "'cd' \"$HOME\" && 'exec' 'sh'");
    }

    #[test]
    fn test_kill_script_without_tmux_succeeds() {
        let dir = TempDir::new().unwrap();
        let names = DerivedNames::for_session("ws-kill");
        let status = StdCommand::new("/bin/sh")
            .arg("-c")
            .arg(remote_command(&kill_script(&names)))
            .env("PATH", dir.path())
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    #[serial]
    async fn test_preflight_maps_exit_255_to_connection_error() {
        let dir = TempDir::new().unwrap();
        let fake = dir.path().join("ssh");
        std::fs::write(&fake, "#!/bin/sh\necho 'Permission denied (publickey).' >&2\nexit 255\n")
            .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = SshConfig {
            binary: fake.display().to_string(),
            ..SshConfig::default()
        };
        let err = RemoteLauncher::new(&config)
            .preflight(&target(&dir))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Connection(_)));
        assert!(err.to_string().contains("Permission denied"));
    }

    #[tokio::test]
    #[serial]
    async fn test_preflight_success() {
        let dir = TempDir::new().unwrap();
        let fake = dir.path().join("ssh");
        std::fs::write(&fake, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = SshConfig {
            binary: fake.display().to_string(),
            ..SshConfig::default()
        };
        RemoteLauncher::new(&config)
            .preflight(&target(&dir))
            .await
            .unwrap();
    }
}
