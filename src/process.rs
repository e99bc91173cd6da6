use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    task::JoinHandle,
};
use tokio_stream::{wrappers::SplitStream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Environment variable yt-dlp consults to find ffmpeg.
pub const FFMPEG_LOCATION_ENV: &str = "FFMPEG_LOCATION";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Non-empty, trimmed stdout lines.
    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("Could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} was cancelled")]
    Cancelled { program: String },
    #[error("{program} exited with code {exit_code}: {}", .stderr.trim())]
    Execution {
        program: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
}

impl ProcessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessError::Cancelled { .. })
    }
}

enum Interrupt {
    TimedOut,
    Cancelled,
}

/// Launches external tools with captured output, a timeout and cooperative
/// cancellation.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    ffmpeg_location: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every spawned process gets `FFMPEG_LOCATION` pointing here.
    pub fn with_ffmpeg_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.ffmpeg_location = Some(location.into());
        self
    }

    pub fn ffmpeg_location(&self) -> Option<&Path> {
        self.ffmpeg_location.as_deref()
    }

    /// Runs `program` to completion.
    ///
    /// The process is killed when `timeout` elapses or `cancel` fires, and the
    /// call resolves to [`ProcessError::Timeout`] or [`ProcessError::Cancelled`]
    /// respectively. A process that exits on its own always yields a
    /// [`ProcessResult`], whatever its exit code.
    pub async fn run<I, S>(
        &self,
        program: impl AsRef<OsStr>,
        args: I,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = program.as_ref();
        let name = program.to_string_lossy().into_owned();

        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled { program: name });
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(location) = &self.ffmpeg_location {
            command.env(FFMPEG_LOCATION_ENV, location);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: name.clone(),
            source,
        })?;
        debug!("Started {} (pid {:?})", name, child.id());

        let mut stdout = tokio::spawn(drain(child.stdout.take(), name.clone(), "stdout"));
        let mut stderr = tokio::spawn(drain(child.stderr.take(), name.clone(), "stderr"));

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let exited = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            status = child.wait() => Ok(status?),
            _ = &mut deadline => Err(Interrupt::TimedOut),
        };

        let status = match exited {
            Ok(status) => status,
            Err(interrupt) => {
                if let Err(e) = child.kill().await {
                    warn!("Could not kill {}: {}", name, e);
                }
                return Err(interrupted(interrupt, name, timeout, [&stdout, &stderr]));
            }
        };

        // Background grandchildren inherit the pipes and can hold them open
        // long after the direct child is gone.
        let drained = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            output = futures::future::join(&mut stdout, &mut stderr) => Ok(output),
            _ = &mut deadline => Err(Interrupt::TimedOut),
        };

        let (stdout, stderr) = match drained {
            Ok(output) => output,
            Err(interrupt) => {
                return Err(interrupted(interrupt, name, timeout, [&stdout, &stderr]));
            }
        };

        let result = ProcessResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout.unwrap_or_default(),
            stderr: stderr.unwrap_or_default(),
        };
        debug!("{} exited with code {}", name, result.exit_code);

        Ok(result)
    }

    /// Like [`ProcessRunner::run`], but a non-zero exit becomes
    /// [`ProcessError::Execution`].
    pub async fn run_checked<I, S>(
        &self,
        program: impl AsRef<OsStr>,
        args: I,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = program.as_ref();
        let result = self.run(program, args, timeout, cancel).await?;

        if result.is_success() {
            Ok(result)
        } else {
            Err(ProcessError::Execution {
                program: program.to_string_lossy().into_owned(),
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            })
        }
    }
}

fn interrupted(
    interrupt: Interrupt,
    program: String,
    timeout: Duration,
    drains: [&JoinHandle<String>; 2],
) -> ProcessError {
    for drain in drains {
        drain.abort();
    }

    match interrupt {
        Interrupt::TimedOut => {
            warn!("{} timed out after {:?}", program, timeout);
            ProcessError::Timeout { program, timeout }
        }
        Interrupt::Cancelled => {
            info!("{} cancelled", program);
            ProcessError::Cancelled { program }
        }
    }
}

/// Collects a pipe line by line. Lines are decoded lossily, since tools print
/// in the console codepage when they are not attached to a terminal.
async fn drain<R>(pipe: Option<R>, program: String, stream: &'static str) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return String::new();
    };

    let mut lines = SplitStream::new(BufReader::new(pipe).split(b'\n'));
    let mut buf = String::new();

    while let Some(line) = lines.next().await {
        match line {
            Ok(mut bytes) => {
                if bytes.last() == Some(&b'\r') {
                    bytes.pop();
                }
                let line = String::from_utf8_lossy(&bytes);
                trace!("{} {}: {}", program, stream, line);
                buf.push_str(&line);
                buf.push('\n');
            }
            Err(e) => {
                warn!("Could not read {} {}: {}", program, stream, e);
                break;
            }
        }
    }

    buf
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let runner = ProcessRunner::new();
        let result = runner
            .run(
                "sh",
                ["-c", "echo out; echo err 1>&2; exit 3"],
                LONG,
                &CancellationToken::new(),
            )
            .await
            .expect("process should run");

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn run_checked_rejects_failure() {
        let runner = ProcessRunner::new();
        let err = runner
            .run_checked("sh", ["-c", "echo boom 1>&2; exit 2"], LONG, &CancellationToken::new())
            .await
            .expect_err("non-zero exit should fail");

        match err {
            ProcessError::Execution {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn injects_ffmpeg_location() {
        let runner = ProcessRunner::new().with_ffmpeg_location("/opt/ffmpeg/bin");
        let result = runner
            .run_checked(
                "sh",
                ["-c", "printf %s \"$FFMPEG_LOCATION\""],
                LONG,
                &CancellationToken::new(),
            )
            .await
            .expect("process should run");

        assert_eq!(result.stdout.trim(), "/opt/ffmpeg/bin");
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let runner = ProcessRunner::new();
        let started = std::time::Instant::now();
        let err = runner
            .run(
                "sleep",
                ["5"],
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await
            .expect_err("sleep should time out");

        assert!(err.is_timeout(), "expected timeout, got {:?}", err);
        assert!(!err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn undecodable_bytes_do_not_stop_reading() {
        let result = ProcessRunner::new()
            .run(
                "sh",
                [
                    "-c",
                    "printf 'Caf\\351 title\\n'; printf '\\377\\n' 1>&2; sleep 0.1; \
                     echo https://example.com/v.mp4; echo done 1>&2",
                ],
                LONG,
                &CancellationToken::new(),
            )
            .await
            .expect("process should run");

        assert_eq!(result.exit_code, 0);
        assert_eq!(
            result.stdout,
            "Caf\u{FFFD} title\nhttps://example.com/v.mp4\n"
        );
        assert_eq!(result.stderr, "\u{FFFD}\ndone\n");
        assert_eq!(
            result.stdout_lines().collect::<Vec<_>>(),
            ["Caf\u{FFFD} title", "https://example.com/v.mp4"]
        );
    }

    #[tokio::test]
    async fn timeout_covers_background_children() {
        let started = std::time::Instant::now();
        let err = ProcessRunner::new()
            .run(
                "sh",
                ["-c", "sleep 4 & echo hi"],
                Duration::from_millis(300),
                &CancellationToken::new(),
            )
            .await
            .expect_err("inherited pipes outlive the deadline");

        assert!(err.is_timeout(), "expected timeout, got {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn cancellation_before_timeout() {
        let runner = ProcessRunner::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = runner
            .run("sleep", ["5"], LONG, &cancel)
            .await
            .expect_err("sleep should be cancelled");

        assert!(err.is_cancelled(), "expected cancellation, got {:?}", err);
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn already_cancelled_does_not_spawn() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ProcessRunner::new()
            .run("this-program-does-not-exist", ["x"], LONG, &cancel)
            .await
            .expect_err("should be cancelled");

        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn missing_program() {
        let err = ProcessRunner::new()
            .run(
                "this-program-does-not-exist",
                Vec::<String>::new(),
                LONG,
                &CancellationToken::new(),
            )
            .await
            .expect_err("spawn should fail");

        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
