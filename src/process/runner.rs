//! Launches one external stage program and supervises it until exit.
//!
//! The command is wrapped in the platform shell so that it behaves exactly
//! as it would when copy-pasted into a terminal:
//!
//! ```text
//! POSIX:   bash -c "<argv joined, tokens with spaces double-quoted>"
//! Windows: cmd.exe /C <argv...>
//! ```
//!
//! stdout and stderr are drained by one reader task that forwards every line
//! to the log stream and turns `NN%` tokens into progress hints. A carriage
//! return ends a line just like a newline does.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};
use crate::process::CancelToken;

/// How long output is still collected after the program has exited.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Receives fractional completion hints in `[0, 1]`.
pub type ProgressSink = Arc<dyn Fn(f64) + Send + Sync>;

/// Receives every output line of the subprocess.
pub type LogSink = mpsc::UnboundedSender<String>;

/// Shell used to host the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellPlatform {
    Posix,
    Windows,
}

impl ShellPlatform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Posix
        }
    }
}

/// Double-quote a token that contains a space.
pub fn quote_arg(arg: &str) -> String {
    let trimmed = arg.trim();
    if trimmed.contains(' ') {
        format!("\"{}\"", trimmed)
    } else {
        arg.to_string()
    }
}

/// Wrap `argv` in the platform shell.
pub fn shell_invocation(argv: &[String], platform: ShellPlatform) -> Vec<String> {
    match platform {
        ShellPlatform::Posix => {
            let joined = argv
                .iter()
                .map(|arg| quote_arg(arg))
                .collect::<Vec<_>>()
                .join(" ");
            vec!["bash".to_string(), "-c".to_string(), joined]
        }
        ShellPlatform::Windows => {
            let mut shell = vec!["cmd.exe".to_string(), "/C".to_string()];
            shell.extend(argv.iter().cloned());
            shell
        }
    }
}

/// Human-readable form of a shell invocation, quoted with the same rule.
pub fn printable_command(shell: &[String]) -> String {
    shell
        .iter()
        .map(|token| {
            if token.contains(' ') {
                format!("\"{}\"", token)
            } else {
                token.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extract a completion hint from an output line.
///
/// The first whitespace-delimited token containing `%` is read up to the sign
/// and divided by 100. Carriage-return refreshed lines (progress bars) are
/// read from their most recent segment.
pub fn parse_progress_hint(line: &str) -> Option<f64> {
    line.rsplit('\r').find_map(|segment| {
        let token = segment.split_whitespace().find(|t| t.contains('%'))?;
        let number = &token[..token.find('%')?];
        let value = number.parse::<f64>().ok()?;
        if value.is_finite() {
            Some((value / 100.0).clamp(0.0, 1.0))
        } else {
            None
        }
    })
}

/// Runs stage programs one at a time on behalf of a single stage run.
#[derive(Clone)]
pub struct ProcessRunner {
    name: String,
    platform: ShellPlatform,
    env: BTreeMap<String, String>,
    cancel: CancelToken,
    log_sink: Option<LogSink>,
}

impl ProcessRunner {
    /// Create a runner whose log lines are tagged with `name`.
    pub fn new(name: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            name: name.into(),
            platform: ShellPlatform::current(),
            env: BTreeMap::new(),
            cancel,
            log_sink: None,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_log_sink(mut self, sink: Option<LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn with_platform(mut self, platform: ShellPlatform) -> Self {
        self.platform = platform;
        self
    }

    /// Run `argv` to completion and return its exit code.
    ///
    /// A nonzero code is logged as an error but returned as `Ok`; the caller
    /// decides whether it is fatal. Returns `Err(Cancelled)` without spawning
    /// anything if the token is already cancelled, and kills the process if
    /// the token fires while it is running.
    pub async fn run(
        &self,
        argv: &[String],
        working_dir: Option<&Path>,
        progress: Option<ProgressSink>,
    ) -> Result<i32> {
        self.cancel.checkpoint()?;

        if argv.is_empty() {
            return Err(PipelineError::Config(format!(
                "empty command line for {}",
                self.name
            )));
        }

        let shell = shell_invocation(argv, self.platform);
        let printable = printable_command(&shell);
        tracing::info!("Executing command:\n{}", printable);
        tracing::info!("This command should run directly if copy-pasted into your shell");

        let mut command = Command::new(&shell[0]);
        command
            .args(&shell[1..])
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| PipelineError::Spawn {
            command: argv[0].clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut reader = tokio::spawn(drain_output(
            self.name.clone(),
            stdout,
            stderr,
            self.log_sink.clone(),
            progress,
        ));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| PipelineError::io(PathBuf::from(&argv[0]), e))?,
            _ = self.cancel.cancelled() => {
                tracing::warn!("{}: cancelled, terminating subprocess", self.name);
                if let Err(e) = child.kill().await {
                    tracing::warn!("{}: failed to kill subprocess: {}", self.name, e);
                }
                reader.abort();
                return Err(PipelineError::Cancelled);
            }
        };

        // Pick up lines still buffered in the pipes. A background child of the
        // program may keep them open, so the wait is bounded.
        let drained = tokio::select! {
            _ = &mut reader => true,
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(OUTPUT_GRACE) => {
                tracing::warn!("{}: output still open after exit, detaching reader", self.name);
                true
            }
        };
        reader.abort();
        if !drained {
            return Err(PipelineError::Cancelled);
        }

        tracing::info!("{}: runner finished", self.name);

        let code = status.code().unwrap_or(-1);
        if code != 0 {
            tracing::error!(
                "Runner '{}' exited with value {}. Please check output above for indications of the problem.",
                self.name,
                code
            );
        }
        Ok(code)
    }
}

enum NextLine {
    Stdout(Option<String>),
    Stderr(Option<String>),
}

/// Splits a pipe into lines ended by `\n` or `\r`, so progress bars that
/// redraw in place yield one line per refresh. Bytes are decoded lossily.
struct LineReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            pending: Vec::new(),
        }
    }

    /// Next non-empty line, or `None` at end of stream.
    async fn next_line(&mut self) -> Option<String> {
        loop {
            let available = match self.inner.fill_buf().await {
                Ok(available) => available,
                Err(e) => {
                    tracing::debug!("output read failed: {}", e);
                    return self.take_pending();
                }
            };
            if available.is_empty() {
                return self.take_pending();
            }

            match available.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(end) => {
                    self.pending.extend_from_slice(&available[..end]);
                    self.inner.consume(end + 1);
                    if let Some(line) = self.take_pending() {
                        return Some(line);
                    }
                }
                None => {
                    let len = available.len();
                    self.pending.extend_from_slice(available);
                    self.inner.consume(len);
                }
            }
        }
    }

    fn take_pending(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

async fn next_line<R>(lines: &mut Option<LineReader<R>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => None,
    }
}

async fn drain_output(
    name: String,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    log_sink: Option<LogSink>,
    progress: Option<ProgressSink>,
) {
    let mut out = stdout.map(LineReader::new);
    let mut err = stderr.map(LineReader::new);

    while out.is_some() || err.is_some() {
        let next = tokio::select! {
            line = next_line(&mut out), if out.is_some() => NextLine::Stdout(line),
            line = next_line(&mut err), if err.is_some() => NextLine::Stderr(line),
        };

        let line = match next {
            NextLine::Stdout(Some(line)) | NextLine::Stderr(Some(line)) => line,
            NextLine::Stdout(None) => {
                out = None;
                continue;
            }
            NextLine::Stderr(None) => {
                err = None;
                continue;
            }
        };

        tracing::info!(stage = %name, "{}: {}", name, line);
        if let Some(sink) = &log_sink {
            let _ = sink.send(line.clone());
        }
        if let Some(progress) = &progress {
            if line.contains('%') {
                if let Some(hint) = parse_progress_hint(&line) {
                    progress(hint);
                }
            }
        }
    }
}
