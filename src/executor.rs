//! Command execution under a target user identity.
//!
//! The executor resolves the target user, builds the child environment, hands
//! the credentials to the spawn primitive (std applies the gid before the uid
//! in the child, before `exec`), captures stdout and stderr as one stream and
//! bounds the wall-clock time of the child.
//!
//! # Output capture
//!
//! stdout and stderr share one pipe, so the captured text interleaves the way
//! a terminal would show it. A helper thread drains the pipe while the calling
//! thread waits on the child; the result is handed back over a channel. Output
//! beyond [`MAX_OUTPUT_BYTES`] is read and discarded so a chatty command never
//! blocks on a full pipe.
//!
//! # Timeout
//!
//! The child is placed in its own process group. When the bound expires the
//! whole group gets `SIGKILL`, so helpers spawned by a hung script go with it.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getegid, geteuid, pipe2, Pid, User};
use wait_timeout::ChildExt;

use crate::error::CommandError;

/// Upper bound on a command's wall-clock time.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured output beyond this many bytes is discarded.
pub const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

/// How long to wait for the output pipe to close once the child has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Identity a command runs as.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunAs {
    /// The user this process runs as.
    #[default]
    CurrentUser,
    /// A named local user.
    User(String),
}

impl RunAs {
    /// Map an optional configured user name to a `RunAs`.
    #[must_use]
    pub fn from_config(user: Option<&str>) -> Self {
        user.map_or(Self::CurrentUser, |u| Self::User(u.to_string()))
    }
}

/// One command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Program followed by its arguments.
    pub args: Vec<String>,
    /// Identity to run the program as.
    pub runas: RunAs,
}

impl CommandRequest {
    /// Request to run `args` as `runas`.
    #[must_use]
    pub fn new(args: Vec<String>, runas: RunAs) -> Self {
        Self { args, runas }
    }

    /// The program name, or an empty string for an empty command.
    #[must_use]
    pub fn program(&self) -> &str {
        self.args.first().map_or("", String::as_str)
    }
}

/// Result of a successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Name of the user the command ran as.
    pub user: String,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Runs commands on behalf of the dispatcher.
pub trait Executor {
    /// Run `request` to completion.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] describing why the command did not succeed.
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError>;
}

/// Credentials resolved for the child process.
#[derive(Debug, Clone)]
struct Credentials {
    name: String,
    uid: u32,
    gid: u32,
    home: PathBuf,
    /// False when the target is the identity we already run as.
    switch: bool,
}

impl Credentials {
    fn resolve(runas: &RunAs) -> Result<Self, CommandError> {
        let lookup = match runas {
            RunAs::CurrentUser => {
                let uid = geteuid();
                User::from_uid(uid).map(|u| u.ok_or_else(|| uid.to_string()))
            }
            RunAs::User(name) => User::from_name(name).map(|u| u.ok_or_else(|| name.clone())),
        };

        let user = match lookup {
            Ok(Ok(user)) => user,
            Ok(Err(user)) => return Err(CommandError::UnknownUser { user }),
            Err(errno) => {
                return Err(CommandError::SubprocessError {
                    message: format!("user lookup failed: {errno}"),
                })
            }
        };

        Ok(Self {
            switch: user.uid != geteuid() || user.gid != getegid(),
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        })
    }
}

/// Executor backed by real processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemExecutor {
    timeout: Duration,
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemExecutor {
    /// Executor with the standard 30 second bound.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: COMMAND_TIMEOUT,
        }
    }

    /// Executor with a custom bound. The daemon always uses [`COMMAND_TIMEOUT`];
    /// shorter bounds exist for tests.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn build_command(program: &str, args: &[String], creds: &Credentials, cwd: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .env("HOME", &creds.home)
            .env("LOGNAME", &creds.name)
            .env("USER", &creds.name)
            .env("PWD", cwd)
            .stdin(Stdio::null())
            .process_group(0);
        if creds.switch {
            cmd.gid(creds.gid).uid(creds.uid);
        }
        cmd
    }

    fn spawn_error(err: &io::Error, program: &str, creds: &Credentials) -> CommandError {
        match err.kind() {
            io::ErrorKind::NotFound => CommandError::NotFound {
                program: program.to_string(),
            },
            io::ErrorKind::PermissionDenied => CommandError::PermissionDenied {
                program: program.to_string(),
                user: creds.name.clone(),
                message: err.to_string(),
            },
            _ => CommandError::SubprocessError {
                message: format!("could not run {program} as user {}: {err}", creds.name),
            },
        }
    }

    fn wait(&self, child: &mut Child, output: &Receiver<io::Result<Vec<u8>>>) -> Result<ExitStatus, CommandError> {
        match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => Ok(status),
            Ok(None) => {
                tracing::warn!(
                    pid = child.id(),
                    timeout_secs = self.timeout.as_secs(),
                    "command timed out, killing process group"
                );
                terminate(child);
                Err(CommandError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                    output: collect(output),
                })
            }
            Err(e) => {
                terminate(child);
                Err(CommandError::SubprocessError {
                    message: format!("failed to wait for command: {e}"),
                })
            }
        }
    }
}

impl Executor for SystemExecutor {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError> {
        let creds = Credentials::resolve(&request.runas)?;

        let Some((program, args)) = request.args.split_first() else {
            return Err(CommandError::SubprocessError {
                message: "empty command".to_string(),
            });
        };

        let cwd = std::env::current_dir().map_err(|e| CommandError::SubprocessError {
            message: format!("cannot determine working directory: {e}"),
        })?;

        tracing::info!(
            command = %request.args.join(" "),
            user = %creds.name,
            "running command"
        );

        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(|e| CommandError::SubprocessError {
            message: format!("failed to create output pipe: {e}"),
        })?;
        let write_err = write_end.try_clone().map_err(|e| CommandError::SubprocessError {
            message: format!("failed to duplicate output pipe: {e}"),
        })?;

        let mut cmd = Self::build_command(program, args, &creds, &cwd);
        cmd.stdout(Stdio::from(write_end)).stderr(Stdio::from(write_err));
        let spawned = cmd.spawn();
        // Close our copies of the write end so the reader sees EOF when the child exits.
        drop(cmd);

        let mut child = spawned.map_err(|e| Self::spawn_error(&e, program, &creds))?;

        let (tx, rx) = bounded(1);
        let reader = File::from(read_end);
        let drain = thread::Builder::new()
            .name("occ-output".to_string())
            .spawn(move || {
                let _ = tx.send(read_bounded(reader));
            });
        if let Err(e) = drain {
            terminate(&mut child);
            return Err(CommandError::SubprocessError {
                message: format!("failed to start output reader: {e}"),
            });
        }

        let status = self.wait(&mut child, &rx)?;
        let output = collect(&rx);

        match status.code() {
            Some(0) => {
                tracing::debug!(user = %creds.name, %output, "command succeeded");
                Ok(CommandOutput {
                    user: creds.name,
                    output,
                })
            }
            Some(code) => Err(CommandError::NonZeroExit { code, output }),
            None => {
                let signal = status.signal().unwrap_or_default();
                Err(CommandError::NonZeroExit {
                    code: -signal,
                    output,
                })
            }
        }
    }
}

/// Read the whole pipe, keeping at most `MAX_OUTPUT_BYTES`.
fn read_bounded(mut reader: File) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    (&mut reader).take(MAX_OUTPUT_BYTES).read_to_end(&mut buf)?;
    io::copy(&mut reader, &mut io::sink())?;
    Ok(buf)
}

fn collect(rx: &Receiver<io::Result<Vec<u8>>>) -> String {
    match rx.recv_timeout(OUTPUT_DRAIN_TIMEOUT) {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => format!("<failed to read command output: {e}>"),
        Err(RecvTimeoutError::Timeout) => "<output pipe still held open by a background process>".to_string(),
        Err(RecvTimeoutError::Disconnected) => String::new(),
    }
}

/// Kill the child's process group and reap the child.
fn terminate(child: &mut Child) {
    let killed = i32::try_from(child.id())
        .ok()
        .map(|pid| killpg(Pid::from_raw(pid), Signal::SIGKILL));
    if !matches!(killed, Some(Ok(()))) {
        let _ = child.kill();
    }
    let _ = child.wait();
}
