//! Purpose: Spawn, stream, and tear down engine processes.
//! Exports: `Backend`, `EngineProcess`, `EngineOutput`, `Spawned`, `ExitReport`,
//!          `ProcessBackend`, `run_to_completion`.
//! Role: Process driver behind a narrow spawn/read/terminate seam.
//! Invariants: stdin is never attached; stdout is handed to exactly one reader.
//! Invariants: Stderr is drained continuously into a capped buffer so the
//!             engine never blocks on diagnostics.
//! Invariants: `terminate` escalates from SIGTERM to SIGKILL after the grace
//!             period and always reaps the child.
#![allow(clippy::result_large_err)]

use crate::core::error::{Error, ErrorKind};
use crate::core::invocation::Invocation;
use async_trait::async_trait;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cap on retained stderr; the rest is read and discarded.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// How long to wait for the stderr pipe to close after the child exits.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub type EngineOutput = Box<dyn AsyncRead + Send + Unpin>;

pub struct Spawned {
    pub stdout: EngineOutput,
    pub process: Box<dyn EngineProcess>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExitReport {
    /// `None` when the process ended by signal.
    pub code: Option<i32>,
    pub stderr: String,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turns a failed exit into an error carrying stderr and the command line.
    pub fn check(self, invocation: &Invocation) -> Result<(), Error> {
        if self.success() {
            return Ok(());
        }
        let kind = if reports_connect_failure(&self.stderr) {
            ErrorKind::Unreachable
        } else {
            ErrorKind::Execution
        };
        let message = match self.code {
            Some(code) => format!("engine exited with status {code}"),
            None => "engine terminated by signal".to_string(),
        };
        let mut err = Error::new(kind)
            .with_message(message)
            .with_input(invocation.to_string())
            .with_stderr(self.stderr);
        if let Some(code) = self.code {
            err = err.with_exit_code(code);
        }
        Err(err)
    }
}

fn reports_connect_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    [
        "failed to connect",
        "couldn't connect",
        "could not connect",
        "unable to connect",
        "connection refused",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Starts engine commands. Implementations may spawn processes or talk to a
/// node directly, as long as they hand back a byte stream and a handle.
#[async_trait]
pub trait Backend: fmt::Debug + Send + Sync {
    async fn spawn(&self, invocation: &Invocation) -> Result<Spawned, Error>;
}

/// A running engine command owned by exactly one consumer.
#[async_trait]
pub trait EngineProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Waits for a natural exit and reports the status with captured stderr.
    async fn wait(&mut self) -> Result<ExitReport, Error>;

    /// Requests graceful shutdown, forcing it once `grace` has elapsed.
    async fn terminate(&mut self, grace: Duration) -> Result<ExitReport, Error>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessBackend;

impl ProcessBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    async fn spawn(&self, invocation: &Invocation) -> Result<Spawned, Error> {
        debug!(command = %invocation, "spawning engine");
        let mut child = Command::new(invocation.program())
            .args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| spawn_error(invocation, err))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("engine stdout was not captured")
        })?;
        let stderr = child.stderr.take().map(StderrCapture::start);
        let pid = child.id();
        debug!(pid, "engine started");

        Ok(Spawned {
            stdout: Box::new(stdout),
            process: Box::new(ChildProcess { child, pid, stderr }),
        })
    }
}

fn spawn_error(invocation: &Invocation, err: std::io::Error) -> Error {
    let base = Error::new(ErrorKind::Unreachable).with_input(invocation.to_string());
    let program = invocation.program().display().to_string();
    match err.kind() {
        std::io::ErrorKind::NotFound => base
            .with_message(format!("engine program `{program}` not found"))
            .with_hint("Install tenzir-ctl or point --program at it.")
            .with_source(err),
        std::io::ErrorKind::PermissionDenied => base
            .with_message(format!("permission denied executing `{program}`"))
            .with_hint("Check the executable bit and ownership of the engine program.")
            .with_source(err),
        _ => base
            .with_message(format!("failed to spawn `{program}`"))
            .with_source(err),
    }
}

struct StderrCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl StderrCapture {
    fn start(mut stderr: ChildStderr) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(read) => {
                        let mut sink = sink.lock().unwrap_or_else(|poison| poison.into_inner());
                        let room = MAX_STDERR_BYTES.saturating_sub(sink.len());
                        sink.extend_from_slice(&chunk[..read.min(room)]);
                    }
                    Err(err) => {
                        warn!(error = %err, "error reading engine stderr");
                        break;
                    }
                }
            }
        });
        Self { buffer, task }
    }

    async fn finish(self) -> String {
        let mut task = self.task;
        if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
        let bytes = self
            .buffer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    stderr: Option<StderrCapture>,
}

impl ChildProcess {
    async fn report(&mut self, status: ExitStatus) -> ExitReport {
        let stderr = match self.stderr.take() {
            Some(capture) => capture.finish().await,
            None => String::new(),
        };
        ExitReport {
            code: status.code(),
            stderr,
        }
    }
}

#[async_trait]
impl EngineProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> Result<ExitReport, Error> {
        let status = self.child.wait().await.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to wait for engine")
                .with_source(err)
        })?;
        debug!(pid = self.pid, code = status.code(), "engine exited");
        Ok(self.report(status).await)
    }

    async fn terminate(&mut self, grace: Duration) -> Result<ExitReport, Error> {
        let exited = self.child.try_wait().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to poll engine status")
                .with_source(err)
        })?;
        if let Some(status) = exited {
            return Ok(self.report(status).await);
        }

        request_shutdown(&mut self.child, self.pid);
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("failed to wait for engine")
                    .with_source(err));
            }
            Err(_) => {
                warn!(
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "engine ignored SIGTERM; killing"
                );
                self.child.kill().await.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to kill engine")
                        .with_source(err)
                })?;
                self.child.wait().await.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to reap engine")
                        .with_source(err)
                })?
            }
        };
        debug!(pid = self.pid, "engine terminated");
        Ok(self.report(status).await)
    }
}

#[cfg(unix)]
fn request_shutdown(child: &mut Child, pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    // SAFETY: plain signal delivery to a child we spawned and have not reaped.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, error = %err, "SIGTERM to engine failed; killing");
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn request_shutdown(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

/// Runs a short-lived engine command to completion and returns its stdout.
pub async fn run_to_completion(
    backend: &dyn Backend,
    invocation: &Invocation,
    timeout: Duration,
    grace: Duration,
) -> Result<Vec<u8>, Error> {
    let Spawned {
        mut stdout,
        mut process,
    } = backend.spawn(invocation).await?;

    let outcome = tokio::time::timeout(timeout, async {
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read engine output")
                .with_source(err)
        })?;
        let report = process.wait().await?;
        Ok::<_, Error>((out, report))
    })
    .await;

    match outcome {
        Ok(Ok((out, report))) => {
            report.check(invocation)?;
            Ok(out)
        }
        Ok(Err(err)) => {
            if let Err(teardown) = process.terminate(grace).await {
                warn!(error = %teardown, "failed to terminate engine after read failure");
            }
            Err(err)
        }
        Err(_) => {
            if let Err(err) = process.terminate(grace).await {
                warn!(error = %err, "failed to terminate timed out engine");
            }
            Err(Error::new(ErrorKind::Timeout)
                .with_message(format!(
                    "engine did not finish within {} ms",
                    timeout.as_millis()
                ))
                .with_input(invocation.to_string()))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::{Backend, EngineProcess, ExitReport, ProcessBackend, Spawned, run_to_completion};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::invocation::Invocation;
    use async_trait::async_trait;
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncRead, ReadBuf};

    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")))
        }
    }

    struct StuckProcess {
        terminated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl EngineProcess for StuckProcess {
        fn id(&self) -> Option<u32> {
            None
        }

        async fn wait(&mut self) -> Result<ExitReport, Error> {
            Ok(ExitReport::default())
        }

        async fn terminate(&mut self, _grace: Duration) -> Result<ExitReport, Error> {
            self.terminated.store(true, Ordering::SeqCst);
            Err(Error::new(ErrorKind::Io).with_message("engine refused to die"))
        }
    }

    #[derive(Debug, Default)]
    struct BrokenBackend {
        terminated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Backend for BrokenBackend {
        async fn spawn(&self, _invocation: &Invocation) -> Result<Spawned, Error> {
            Ok(Spawned {
                stdout: Box::new(BrokenPipe),
                process: Box::new(StuckProcess {
                    terminated: Arc::clone(&self.terminated),
                }),
            })
        }
    }

    fn sh(script: &str) -> Invocation {
        Invocation::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn collects_stdout_on_success() {
        let out = run_to_completion(
            &ProcessBackend::new(),
            &sh("printf 8"),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .await
        .expect("run");
        assert_eq!(out, b"8");
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let err = run_to_completion(
            &ProcessBackend::new(),
            &sh("echo 'query failed: bad syntax' >&2; exit 3"),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .await
        .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.stderr().expect("stderr").contains("bad syntax"));
    }

    #[tokio::test]
    async fn missing_program_is_unreachable() {
        let invocation = Invocation::new("/nonexistent/tenzir-ctl").arg("status");
        let err = ProcessBackend::new()
            .spawn(&invocation)
            .await
            .err()
            .expect("spawn error");
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert!(err.hint().is_some());
    }

    #[tokio::test]
    async fn read_failure_terminates_and_keeps_the_read_error() {
        let backend = BrokenBackend::default();
        let err = run_to_completion(
            &backend,
            &Invocation::new("tenzir-ctl").arg("count"),
            Duration::from_secs(5),
            Duration::from_millis(100),
        )
        .await
        .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.message(), Some("failed to read engine output"));
        assert!(backend.terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn hang_times_out_and_terminates() {
        let started = Instant::now();
        let err = run_to_completion(
            &ProcessBackend::new(),
            &sh("exec sleep 30"),
            Duration::from_millis(200),
            Duration::from_secs(1),
        )
        .await
        .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn terminate_escalates_to_kill() {
        let spawned = ProcessBackend::new()
            .spawn(&sh("trap '' TERM; while true; do sleep 0.05; done"))
            .await
            .expect("spawn");
        let mut process = spawned.process;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let report = process
            .terminate(Duration::from_millis(200))
            .await
            .expect("terminate");
        assert!(!report.success());
        assert_eq!(report.code, None);
    }

    #[test]
    fn connect_failures_map_to_unreachable() {
        let report = ExitReport {
            code: Some(1),
            stderr: "client failed to connect to node at localhost:5158".to_string(),
        };
        let err = report
            .check(&Invocation::new("tenzir-ctl"))
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }
}
