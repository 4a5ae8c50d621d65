//! Structured external command execution.
//!
//! Every call to the package manager, git, curl, the desktop settings store
//! or the init system goes through a [`CommandRunner`] as a [`CommandSpec`]:
//! a program plus an argument vector. Nothing is ever interpolated into a
//! shell string.
//!
//! # Execution rules
//!
//! - Children are spawned in their own process group and registered with
//!   [`ChildRegistry::global()`] so an interrupted run cleans them up.
//! - stdin is null; provisioning commands are non-interactive.
//! - stdout/stderr are drained on reader threads so a chatty child can never
//!   block on a full pipe while we wait for it.
//! - A wall-clock limit applies to each command; on expiry the whole process
//!   group is terminated and [`ProvisionError::Timeout`] is returned. The
//!   limit covers the output pipes too: a background helper that keeps them
//!   open after the leader exits is killed at the deadline.

use crate::error::{ProvisionError, Result};
use crate::process_guard::{self, ChildRegistry, CommandProcessGroup};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default per-command limit. Large `apt-get upgrade` runs on a fresh image
/// routinely take tens of minutes, so this is generous.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// SIGTERM to SIGKILL delay when a command is stopped at its limit
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Set to `1` or `true` to log mutating commands instead of running them
pub const DRY_RUN_ENV: &str = "VMSETUP_DRY_RUN";

/// Trait for typed collaborator arguments.
///
/// Implementors map struct fields onto the exact argument vector the external
/// tool expects, so flag mismatches are caught where the struct is defined
/// rather than at every call site.
pub trait CommandArgs {
    /// Executable name, resolved through `PATH`
    fn program(&self) -> &'static str;

    /// Arguments exactly as the tool expects them
    fn to_cli_args(&self) -> Vec<String>;

    /// Extra environment for the tool
    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Whether the command only inspects state (safe to run in dry-run mode)
    fn is_read_only(&self) -> bool {
        false
    }

    fn to_spec(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(self.program()).args(self.to_cli_args());
        for (key, value) in self.get_env_vars() {
            spec = spec.env(key, value);
        }
        if self.is_read_only() {
            spec = spec.read_only();
        }
        spec
    }
}

/// A program and its argument vector, plus environment and working directory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<PathBuf>,
    /// Inspects state only; dry-run mode still executes it
    pub read_only: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Human-readable command line for logs. Not meant to be fed to a shell.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                parts.push(format!("'{}'", arg));
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }
}

/// Output from a command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Synthetic successful output with empty streams
    pub fn ok() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// Check if the command succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            return Ok(());
        }
        let code = self.exit_code.unwrap_or(-1);
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        Err(ProvisionError::command(format!(
            "{} failed (exit code {}): {}",
            context, code, detail
        )))
    }
}

/// Capability to execute external commands.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Mutating commands are only logged
    fn is_dry_run(&self) -> bool {
        false
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        (**self).run(spec)
    }

    fn is_dry_run(&self) -> bool {
        (**self).is_dry_run()
    }
}

/// Runs commands on the host.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    /// `None` disables the per-command time limit
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn timed_out(&self, spec: &CommandSpec) -> ProvisionError {
        ProvisionError::Timeout {
            program: spec.program.clone(),
            limit: self.timeout.unwrap_or_default(),
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Some(DEFAULT_COMMAND_TIMEOUT))
    }
}

/// Removes the PID from the global registry however `run` returns.
struct Registration(u32);

impl Registration {
    fn new(pid: u32) -> Self {
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }
        Self(pid)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(self.0);
        }
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

/// Wait for a reader thread to hit EOF. `None` means the pipe was still
/// open at `deadline`.
fn collect(rx: &Receiver<Vec<u8>>, deadline: Option<Instant>) -> Option<Vec<u8>> {
    let received = match deadline {
        Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
        None => rx.recv().map_err(RecvTimeoutError::from),
    };
    match received {
        Ok(buf) => Some(buf),
        Err(RecvTimeoutError::Disconnected) => Some(Vec::new()),
        Err(RecvTimeoutError::Timeout) => None,
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("exec: {}", spec.display());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ProvisionError::command(format!("failed to spawn {}: {}", spec.program, e))
        })?;
        let pid = child.id();
        let _registration = Registration::new(pid);

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = self.timeout.map(|limit| Instant::now() + limit);
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                process_guard::terminate_group(pid, TERMINATE_GRACE);
                let _ = child.wait();
                return Err(self.timed_out(spec));
            }
            thread::sleep(POLL_INTERVAL);
        };

        // The leader is gone, but anything it backgrounded may still hold the pipes
        let (Some(stdout), Some(stderr)) = (collect(&stdout, deadline), collect(&stderr, deadline))
        else {
            warn!(
                "{} exited but its process group kept the output open past the limit",
                spec.program
            );
            process_guard::terminate_group(pid, TERMINATE_GRACE);
            return Err(self.timed_out(spec));
        };

        let output = CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code(),
            success: status.success(),
        };
        debug!(
            "exit: {} -> {:?}",
            spec.program,
            output.exit_code
        );
        Ok(output)
    }
}

/// Logs mutating commands instead of running them.
///
/// Read-only probes still go to the wrapped runner so idempotence checks
/// report the machine's real state and the preview is realistic.
pub struct DryRunRunner<R: CommandRunner> {
    inner: R,
}

impl<R: CommandRunner> DryRunRunner<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

/// Whether `VMSETUP_DRY_RUN` asks for a dry run
pub fn dry_run_requested() -> bool {
    std::env::var(DRY_RUN_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl<R: CommandRunner> CommandRunner for DryRunRunner<R> {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        if spec.read_only {
            return self.inner.run(spec);
        }
        info!("[dry-run] {}", spec.display());
        Ok(CommandOutput::ok())
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}
