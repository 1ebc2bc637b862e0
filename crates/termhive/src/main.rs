//! termhive
//!
//! Command-line front end for persistent terminal sessions.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use crossterm::terminal;
use serde::Serialize;
use termhive::config::{default_config_path, Config};
use termhive::session::{detect_tmux, ClientHandle, SessionManager, SessionRegistry, TmuxDetection};
use termhive::{CleanupReport, SessionEvent, SshConnectionSpec, StartRequest};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Byte that detaches `run` from its session (Ctrl-\).
const DETACH_KEY: u8 = 0x1c;

/// How often `run` checks the local terminal size.
const RESIZE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Log file written while `run` owns the terminal.
const RUN_LOG_FILE: &str = "termhive.log";

/// termhive - persistent local and remote terminal sessions.
#[derive(Parser, Debug)]
#[command(name = "termhive")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Show tmux detection and the paths termhive uses
    Doctor {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Kill orphaned termhive tmux sessions
    Cleanup {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start or reattach a session in this terminal (Ctrl-\ detaches)
    Run {
        /// Session ID
        id: String,

        /// Working directory (default: current directory)
        #[arg(long)]
        cwd: Option<String>,

        /// Program to run (default: configured shell)
        #[arg(long)]
        shell: Option<String>,

        /// Argument passed to the program (repeatable)
        #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Run remotely, as user@host[:path]
        #[arg(long, value_name = "TARGET")]
        ssh: Option<String>,

        /// SSH port
        #[arg(long, requires = "ssh")]
        port: Option<u16>,

        /// SSH private key
        #[arg(long, requires = "ssh", value_name = "FILE")]
        key: Option<String>,

        /// Kill the session on detach instead of leaving it running
        #[arg(long)]
        kill_on_exit: bool,
    },

    /// Print the effective configuration
    Config {
        /// Print only the configuration file path
        #[arg(long)]
        path: bool,

        /// Write the effective configuration to the file if it does not exist
        #[arg(long, conflicts_with = "path")]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let to_file = matches!(cli.command, Commands::Run { .. });
    let _log_guard = init_logging(&config, cli.verbose, to_file)?;
    tracing::debug!(config = %config_path.display(), "Configuration loaded");

    match cli.command {
        Commands::Doctor { json } => doctor(&config, &config_path, json).await?,
        Commands::Cleanup { json } => {
            let registry = SessionRegistry::new(config);
            let report = registry.cleanup_all().await;
            print_cleanup_report(&report, json)?;
            if !report.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Run {
            id,
            cwd,
            shell,
            args,
            ssh,
            port,
            key,
            kill_on_exit,
        } => {
            let mut request = StartRequest::new(id);
            request.cwd = match cwd {
                Some(cwd) => Some(cwd),
                None if ssh.is_none() => std::env::current_dir()
                    .ok()
                    .map(|d| d.display().to_string()),
                None => None,
            };
            request.shell = shell;
            request.args = args;
            if let Some(target) = ssh {
                let mut spec = parse_ssh_target(&target)?;
                spec.port = port;
                spec.key_path = key;
                request.ssh = Some(spec);
            }

            let code = run_session(config, request, kill_on_exit).await?;
            return Ok(ExitCode::from(code));
        }
        Commands::Config { path, init } => {
            if path {
                println!("{}", config_path.display());
            } else if init {
                if config_path.exists() {
                    bail!("{} already exists", config_path.display());
                }
                config.save(&config_path)?;
                println!("Wrote {}", config_path.display());
            } else {
                print!("{}", config.to_toml()?);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Installs the tracing subscriber.
///
/// `RUST_LOG` wins over `--verbose`, which wins over the configured level.
/// With `to_file` the output goes to the log directory instead of stderr.
fn init_logging(config: &Config, verbose: bool, to_file: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("termhive={level},termhive_protocol={level}")));

    if !to_file {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    }

    std::fs::create_dir_all(&config.logging.log_dir).with_context(|| {
        format!(
            "Failed to create log directory: {}",
            config.logging.log_dir.display()
        )
    })?;
    let appender = tracing_appender::rolling::never(&config.logging.log_dir, RUN_LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Parses `user@host[:path]`; the user is optional.
fn parse_ssh_target(value: &str) -> anyhow::Result<SshConnectionSpec> {
    let (user, rest) = value.split_once('@').unwrap_or(("", value));
    let (host, path) = rest.split_once(':').unwrap_or((rest, ""));
    if host.is_empty() {
        bail!("invalid ssh target '{value}', expected user@host[:path]");
    }

    let mut spec = SshConnectionSpec::new(user, host);
    spec.remote_path = path.to_string();
    Ok(spec)
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    tmux: TmuxDetection,
    tmux_required: bool,
    socket_dir: PathBuf,
    config_path: PathBuf,
    ssh_binary: Option<PathBuf>,
}

async fn doctor(config: &Config, config_path: &Path, json: bool) -> anyhow::Result<()> {
    let report = DoctorReport {
        tmux: detect_tmux(&config.tmux).await.clone(),
        tmux_required: config.tmux.required,
        socket_dir: config.tmux.socket_dir(),
        config_path: config_path.to_path_buf(),
        ssh_binary: which::which(&config.ssh.binary).ok(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match (&report.tmux.path, &report.tmux.version) {
        (Some(path), Some(version)) if report.tmux.available => {
            println!("tmux:        {version} ({})", path.display());
        }
        _ => println!(
            "tmux:        not found ({})",
            report.tmux.error.as_deref().unwrap_or("unknown error")
        ),
    }
    println!(
        "required:    {}",
        if report.tmux_required { "yes" } else { "no" }
    );
    println!("socket dir:  {}", report.socket_dir.display());
    println!("config:      {}", report.config_path.display());
    match &report.ssh_binary {
        Some(path) => println!("ssh:         {}", path.display()),
        None => println!("ssh:         not found ({})", config.ssh.binary),
    }
    Ok(())
}

fn print_cleanup_report(report: &CleanupReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Cleaned {} session(s)", report.cleaned);
    for error in &report.errors {
        eprintln!("  error: {error}");
    }
    Ok(())
}

/// Restores cooked mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> anyhow::Result<Self> {
        terminal::enable_raw_mode().context("run requires an interactive terminal")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

enum RunOutcome {
    Detached,
    Exited {
        code: Option<u32>,
        signal: Option<String>,
        runtime_ms: u64,
    },
    Closed,
}

/// Forwards stdin to a channel from a dedicated thread.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buffer = [0u8; 1024];
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Attaches the local terminal to a session. Returns the process exit code.
async fn run_session(config: Config, mut request: StartRequest, kill_on_exit: bool) -> anyhow::Result<u8> {
    let exit_grace = Duration::from_millis(config.session.exit_grace_ms);
    let registry = SessionRegistry::new(config);
    let id = request.session_id.clone();

    let (cols, rows) = terminal::size().unwrap_or((0, 0));
    request.cols = Some(cols).filter(|c| *c > 0);
    request.rows = Some(rows).filter(|r| *r > 0);

    let (owner, mut events) = ClientHandle::new(format!("cli-{}", std::process::id()));
    let result = registry.start(request, owner).await;
    if !result.ok {
        bail!(
            "failed to start session {id}: {}",
            result.error.unwrap_or_default()
        );
    }
    tracing::info!(session_id = %id, reused = result.reused, "Attached");

    let raw = RawModeGuard::enable()?;
    let mut input = spawn_stdin_reader();
    let mut size_tick = tokio::time::interval(RESIZE_POLL_INTERVAL);
    let mut last_size = (cols, rows);
    let mut stdout = std::io::stdout();

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Data { data, .. }) | Some(SessionEvent::History { data, .. }) => {
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                Some(SessionEvent::Exit { code, signal, runtime_ms, .. }) => {
                    break RunOutcome::Exited { code, signal, runtime_ms };
                }
                None => break RunOutcome::Closed,
            },
            bytes = input.recv() => match bytes {
                Some(bytes) => {
                    if let Some(pos) = bytes.iter().position(|b| *b == DETACH_KEY) {
                        registry.write(&id, &bytes[..pos]).await?;
                        break RunOutcome::Detached;
                    }
                    registry.write(&id, &bytes).await?;
                }
                None => break RunOutcome::Detached,
            },
            _ = size_tick.tick() => {
                if let Ok(size) = terminal::size() {
                    if size != last_size {
                        last_size = size;
                        registry.resize(&id, size.0, size.1).await;
                    }
                }
            }
        }
    };
    drop(raw);

    match outcome {
        RunOutcome::Detached if kill_on_exit => {
            registry.kill(&id).await;
            eprintln!("\r\n[termhive] session {id} killed");
            Ok(0)
        }
        RunOutcome::Detached => {
            eprintln!("\r\n[termhive] detached from {id}");
            Ok(0)
        }
        RunOutcome::Exited {
            code,
            signal,
            runtime_ms,
        } => {
            if let Some(signal) = &signal {
                eprintln!("\r\n[termhive] session {id} killed by {signal}");
            }
            if code != Some(0) && Duration::from_millis(runtime_ms) < exit_grace {
                eprintln!(
                    "[termhive] session {id} exited after {runtime_ms}ms; is the command installed?"
                );
            }
            Ok(code.map_or(1, |c| u8::try_from(c).unwrap_or(1)))
        }
        RunOutcome::Closed => {
            eprintln!("\r\n[termhive] session {id} closed");
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ssh_target() {
        let spec = parse_ssh_target("dev@example.com:~/src/app").unwrap();
        assert_eq!(spec.user, "dev");
        assert_eq!(spec.host, "example.com");
        assert_eq!(spec.remote_path, "~/src/app");

        let spec = parse_ssh_target("example.com").unwrap();
        assert_eq!(spec.user, "");
        assert_eq!(spec.remote_path, "");

        assert!(parse_ssh_target("dev@").is_err());
        assert!(parse_ssh_target(":/srv").is_err());
    }

    #[test]
    fn test_cli_run_arguments() {
        let cli = Cli::try_parse_from([
            "termhive", "run", "ws-1", "--shell", "bash", "--arg", "-l", "--arg", "-i", "--ssh",
            "dev@host", "--port", "2222",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                id,
                shell,
                args,
                ssh,
                port,
                kill_on_exit,
                ..
            } => {
                assert_eq!(id, "ws-1");
                assert_eq!(shell.as_deref(), Some("bash"));
                assert_eq!(args, vec!["-l", "-i"]);
                assert_eq!(ssh.as_deref(), Some("dev@host"));
                assert_eq!(port, Some(2222));
                assert!(!kill_on_exit);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_port_requires_ssh() {
        assert!(Cli::try_parse_from(["termhive", "run", "ws-1", "--port", "22"]).is_err());
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from(["termhive", "cleanup", "--json", "-v", "-c", "/tmp/x.toml"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.toml")));
        assert!(matches!(cli.command, Commands::Cleanup { json: true }));
    }

    #[test]
    fn test_cli_config_init() {
        let cli = Cli::try_parse_from(["termhive", "config", "--init"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                path: false,
                init: true
            }
        ));
        assert!(Cli::try_parse_from(["termhive", "config", "--init", "--path"]).is_err());
    }
}
