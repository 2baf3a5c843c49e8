// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Supervised external command execution.
//!
//! Every interaction with the VCS goes through an external `git` process.
//! This module spawns such processes, captures their standard streams
//! incrementally, and keeps them on a leash with a single watchdog timer.
//!
//! # Watchdog
//!
//! When a progress observer is supplied the watchdog acts as a __no-progress__
//! timeout: every progress marker seen on stderr (e.g. `Receiving objects:
//! 42%`) pushes the deadline forward. Without a progress observer the
//! watchdog is a fixed __total__ timeout.
//!
//! When the watchdog fires, the whole process group receives `SIGTERM`,
//! followed by `SIGKILL` if it is still alive after a short grace window. The
//! caller gets [`ProcessError::Timeout`] with all output captured so far.
//!
//! # Environment
//!
//! Inherited proxy variables are always stripped. Mirror selection decides
//! routing, so an ambient proxy must never silently reroute a clone. Git
//! invocations additionally get verbose tracing turned on.

use regex::Regex;
use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    process::Stdio,
    sync::LazyLock,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    time::{sleep, timeout, Instant, Sleep},
};
use tracing::{debug, instrument, trace, warn};

const PROXY_VARS: [&str; 4] = ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];
const KILL_GRACE: Duration = Duration::from_secs(3);
const GROUP_POLL: Duration = Duration::from_millis(50);
const CHUNK_SIZE: usize = 8192;

static PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:Receiving|Resolving|Compressing) objects:\s*(\d+)%")
        .expect("progress pattern is valid")
});

/// Description of a command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    total_timeout: Duration,
    no_progress_timeout: Duration,
}

impl CommandSpec {
    /// Describe invocation of `program` with default timeouts.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            total_timeout: Duration::from_secs(600),
            no_progress_timeout: Duration::from_secs(30),
        }
    }

    /// Describe a `git` invocation.
    pub fn git(args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new("git").args(args)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    pub fn total_timeout(mut self, limit: Duration) -> Self {
        self.total_timeout = limit;
        self
    }

    pub fn no_progress_timeout(mut self, limit: Duration) -> Self {
        self.no_progress_timeout = limit;
        self
    }

    pub fn program(&self) -> &str {
        self.program.as_str()
    }

    pub fn get_args(&self) -> &[String] {
        self.args.as_slice()
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    fn is_git(&self) -> bool {
        Path::new(&self.program)
            .file_stem()
            .is_some_and(|stem| stem == "git")
    }

    /// Arguments actually passed to the process.
    ///
    /// Git clones are made verbose so that failures leave a useful trail.
    fn effective_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if self.is_git() && args.first().is_some_and(|arg| arg == "clone") {
            args.insert(1, "--verbose".into());
        }

        args
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.effective_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for var in PROXY_VARS {
            command.env_remove(var);
        }

        if self.is_git() {
            command
                .env("GIT_CURL_VERBOSE", "1")
                .env("GIT_TRACE", "1")
                .env("GIT_TERMINAL_PROMPT", "0");
        }

        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        // INVARIANT: Child leads its own process group so the watchdog can signal everything it spawned.
        #[cfg(unix)]
        command.process_group(0);

        command
    }
}

type Observer<'a> = Box<dyn FnMut(&str) + Send + 'a>;

/// Optional observers of a running process.
#[derive(Default)]
pub struct Callbacks<'a> {
    /// Receives every stdout chunk.
    pub on_stdout: Option<Observer<'a>>,

    /// Receives every stderr chunk.
    pub on_stderr: Option<Observer<'a>>,

    /// Receives every progress percentage. Switches the watchdog into
    /// no-progress mode.
    pub on_progress: Option<Box<dyn FnMut(u8) + Send + 'a>>,
}

impl<'a> Callbacks<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_progress(on_progress: impl FnMut(u8) + Send + 'a) -> Self {
        Self {
            on_progress: Some(Box::new(on_progress)),
            ..Self::default()
        }
    }
}

/// Captured result of a successful process.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Executor of external commands.
///
/// Implemented by [`ProcessRunner`] for real processes. Acquisition logic is
/// generic over this trait so it can be driven by scripted fakes.
pub trait Execute {
    fn execute(
        &self,
        spec: &CommandSpec,
        callbacks: Callbacks<'_>,
    ) -> impl Future<Output = Result<ProcessOutput>> + Send;
}

/// Executes real processes under a watchdog.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            kill_grace: KILL_GRACE,
        }
    }

    /// Grace window between `SIGTERM` and `SIGKILL` on timeout.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Execute for ProcessRunner {
    #[instrument(
        skip(self, spec, callbacks),
        fields(program = spec.program(), args = ?spec.get_args()),
        level = "debug"
    )]
    async fn execute(&self, spec: &CommandSpec, mut callbacks: Callbacks<'_>) -> Result<ProcessOutput> {
        let program = spec.program().to_string();
        let mut child = spec.command().spawn().map_err(|err| ProcessError::Spawn {
            source: err,
            program: program.clone(),
        })?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stdout_buf = [0u8; CHUNK_SIZE];
        let mut stderr_buf = [0u8; CHUNK_SIZE];

        let period = if callbacks.on_progress.is_some() {
            spec.no_progress_timeout
        } else {
            spec.total_timeout
        };
        let started = Instant::now();
        let mut watchdog: Pin<Box<Sleep>> = Box::pin(sleep(period));
        let mut status = None;

        // INVARIANT: Exactly one exit from this loop settles the result.
        let status = loop {
            if let (Some(exit), None, None) = (status, &stdout_pipe, &stderr_pipe) {
                break exit;
            }

            tokio::select! {
                read = read_chunk(&mut stdout_pipe, &mut stdout_buf) => {
                    if let Some(chunk) = settle_read(read, &mut stdout_pipe, &stdout_buf) {
                        stdout.extend_from_slice(chunk);
                        if let Some(observer) = callbacks.on_stdout.as_mut() {
                            observer(&String::from_utf8_lossy(chunk));
                        }
                    }
                }
                read = read_chunk(&mut stderr_pipe, &mut stderr_buf) => {
                    if let Some(chunk) = settle_read(read, &mut stderr_pipe, &stderr_buf) {
                        stderr.extend_from_slice(chunk);
                        let text = String::from_utf8_lossy(chunk);
                        if let Some(observer) = callbacks.on_stderr.as_mut() {
                            observer(&text);
                        }

                        if let Some(observer) = callbacks.on_progress.as_mut() {
                            let mut progressed = false;
                            for percent in progress_markers(&text) {
                                observer(percent);
                                progressed = true;
                            }

                            if progressed {
                                watchdog.as_mut().reset(Instant::now() + period);
                            }
                        }
                    }
                }
                exit = child.wait(), if status.is_none() => {
                    let exit = exit.map_err(|err| ProcessError::Wait {
                        source: err,
                        program: program.clone(),
                    })?;
                    status = Some(exit);
                }
                () = watchdog.as_mut() => {
                    warn!("{program} made no progress within {period:?}, terminating");
                    terminate(&mut child, self.kill_grace).await;
                    return Err(ProcessError::Timeout {
                        program,
                        elapsed: started.elapsed(),
                        stdout: String::from_utf8_lossy(&stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    });
                }
            }
        };

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        // INVARIANT: Death by signal has no exit code, report it as -1.
        let exit_code = status.code().unwrap_or(-1);
        debug!("{program} exited with {exit_code} after {:?}", started.elapsed());
        if !status.success() {
            return Err(ProcessError::NonZeroExit {
                program,
                code: exit_code,
                stdout,
                stderr,
            });
        }

        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

async fn read_chunk<R>(pipe: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match pipe {
        Some(pipe) => pipe.read(buf).await,
        None => std::future::pending().await,
    }
}

fn settle_read<'b, R>(
    read: std::io::Result<usize>,
    pipe: &mut Option<R>,
    buf: &'b [u8],
) -> Option<&'b [u8]> {
    match read {
        Ok(0) => {
            *pipe = None;
            None
        }
        Ok(len) => Some(&buf[..len]),
        Err(err) => {
            trace!("stream closed with error: {err}");
            *pipe = None;
            None
        }
    }
}

fn progress_markers(text: &str) -> impl Iterator<Item = u8> + '_ {
    PROGRESS
        .captures_iter(text)
        .filter_map(|captures| captures[1].parse::<u8>().ok())
}

async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::Signal;

        let deadline = Instant::now() + grace;
        signal_group(pid, Signal::SIGTERM);
        let _ = timeout(grace, child.wait()).await;

        // INVARIANT: Leader exit says nothing about the rest of its group.
        while group_alive(pid) && Instant::now() < deadline {
            sleep(GROUP_POLL).await;
        }

        if group_alive(pid) {
            warn!("process group {pid} ignored SIGTERM, killing");
            signal_group(pid, Signal::SIGKILL);
        }
    }

    if matches!(child.try_wait(), Ok(None)) {
        if let Err(err) = child.kill().await {
            debug!("failed to kill child process: {err}");
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: i32, signal: nix::sys::signal::Signal) {
    use nix::{sys::signal::killpg, unistd::Pid};

    if let Err(err) = killpg(Pid::from_raw(pid), signal) {
        debug!("failed to send {signal} to process group {pid}: {err}");
    }
}

#[cfg(unix)]
fn group_alive(pid: i32) -> bool {
    use nix::{sys::signal::killpg, unistd::Pid};

    killpg(Pid::from_raw(pid), None).is_ok()
}

/// Process execution error types.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Watchdog fired before the process finished.
    #[error("{program} timed out after {elapsed:?}")]
    Timeout {
        program: String,
        elapsed: Duration,
        stdout: String,
        stderr: String,
    },

    /// Process finished but reported failure.
    #[error("{program} exited with code {code}")]
    NonZeroExit {
        program: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// Process could not be started.
    #[error("failed to spawn {program}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: String,
    },

    /// Process could not be waited on.
    #[error("failed to wait on {program}")]
    Wait {
        #[source]
        source: std::io::Error,
        program: String,
    },
}

impl ProcessError {
    /// Stdout captured before failure.
    pub fn stdout(&self) -> &str {
        match self {
            Self::Timeout { stdout, .. } | Self::NonZeroExit { stdout, .. } => stdout.as_str(),
            Self::Spawn { .. } | Self::Wait { .. } => "",
        }
    }

    /// Stderr captured before failure.
    pub fn stderr(&self) -> &str {
        match self {
            Self::Timeout { stderr, .. } | Self::NonZeroExit { stderr, .. } => stderr.as_str(),
            Self::Spawn { .. } | Self::Wait { .. } => "",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Friendly result alias :3
pub type Result<T, E = ProcessError> = std::result::Result<T, E>;
