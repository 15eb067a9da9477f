//! Purpose: Drive one export from first read to teardown.
//! Exports: `ExportSession`, `SessionState`, `RecordStream`.
//! Role: Owns the engine process and decoder for a single query.
//! Invariants: A session spawns at most one process and never restarts it.
//! Invariants: Every exit path (completion, failure, cancel, drop) reaps or
//!             kills the process.
//! Invariants: Records are yielded in engine emission order, one at a time.
#![allow(clippy::result_large_err)]

use crate::core::decode::{Decoder, Record, SchemaBatch};
use crate::core::error::{Error, ErrorKind};
use crate::core::invocation::{Encoding, ExportMode, ExportRequest, Invocation};
use crate::core::process::{Backend, EngineProcess, Spawned};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Constructed; no process yet.
    Idle,
    Dispatching,
    Streaming,
    Completed,
    Cancelled,
    Failed(ErrorKind),
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed(_)
        )
    }
}

struct Running {
    decoder: Decoder,
    process: Box<dyn EngineProcess>,
}

pub struct ExportSession {
    backend: Arc<dyn Backend>,
    invocation: Invocation,
    mode: ExportMode,
    max_events: Option<u64>,
    encoding: Encoding,
    grace: Duration,
    state: SessionState,
    running: Option<Running>,
    failure: Option<String>,
    delivered: u64,
}

impl ExportSession {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        invocation: Invocation,
        request: &ExportRequest,
        grace: Duration,
    ) -> Self {
        Self {
            backend,
            invocation,
            mode: request.mode,
            max_events: request.max_events,
            encoding: request.encoding,
            grace,
            state: SessionState::Idle,
            running: None,
            failure: None,
            delivered: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> ExportMode {
        self.mode
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn max_events(&self) -> Option<u64> {
        self.max_events
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    /// Pid of the engine process while one is running.
    pub fn process_id(&self) -> Option<u32> {
        self.running.as_ref().and_then(|running| running.process.id())
    }

    /// Records yielded so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Next record, `Ok(None)` once the export has completed.
    pub async fn next_record(&mut self) -> Result<Option<Record>, Error> {
        if !self.ready().await? {
            return Ok(None);
        }
        let Some(running) = self.running.as_mut() else {
            return Ok(None);
        };
        match running.decoder.next_record().await {
            Ok(Some(record)) => {
                self.delivered += 1;
                Ok(Some(record))
            }
            Ok(None) => self.finish().await.map(|()| None),
            Err(err) => Err(self.abort(err).await),
        }
    }

    /// Next schema-tagged batch; only available for Arrow exports.
    pub async fn next_batch(&mut self) -> Result<Option<SchemaBatch>, Error> {
        if self.encoding != Encoding::Arrow {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("batches are only available for arrow exports")
                .with_hint("Request Encoding::Arrow to read schema-tagged batches."));
        }
        if !self.ready().await? {
            return Ok(None);
        }
        let Some(running) = self.running.as_mut() else {
            return Ok(None);
        };
        match running.decoder.next_batch().await {
            Ok(Some(batch)) => {
                self.delivered += batch.num_rows() as u64;
                Ok(Some(batch))
            }
            Ok(None) => self.finish().await.map(|()| None),
            Err(err) => Err(self.abort(err).await),
        }
    }

    /// Stops the export and tears down the engine process.
    ///
    /// Finished sessions are left as they are.
    pub async fn cancel(&mut self) -> Result<(), Error> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.state = SessionState::Cancelled;
        if let Some(running) = self.running.take() {
            let Running {
                decoder,
                mut process,
            } = running;
            drop(decoder);
            process.terminate(self.grace).await?;
        }
        info!(delivered = self.delivered, "export cancelled");
        Ok(())
    }

    /// Pumps records through a bounded channel on a background task.
    pub fn into_stream(self) -> RecordStream {
        let (tx, rx) = mpsc::channel(1);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let mut session = self;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => break,
                    next = session.next_record() => match next {
                        Ok(Some(record)) => {
                            tokio::select! {
                                biased;
                                _ = &mut cancel_rx => break,
                                sent = tx.send(Ok(record)) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(None) => return,
                        Err(err) => {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                    },
                }
            }
            if let Err(err) = session.cancel().await {
                warn!(error = %err, "failed to cancel streamed export");
            }
        });
        RecordStream {
            inner: ReceiverStream::new(rx),
            cancel: Some(cancel_tx),
            task: Some(task),
        }
    }

    /// Returns whether a process is available to read from, starting one on
    /// first use.
    async fn ready(&mut self) -> Result<bool, Error> {
        match self.state {
            SessionState::Idle => {
                self.start().await?;
                Ok(true)
            }
            SessionState::Dispatching | SessionState::Streaming => Ok(self.running.is_some()),
            SessionState::Completed => Ok(false),
            SessionState::Cancelled => Err(Error::new(ErrorKind::Cancelled)
                .with_message("export was cancelled")
                .with_input(self.invocation.to_string())),
            SessionState::Failed(kind) => {
                let message = match &self.failure {
                    Some(message) => format!("export already failed: {message}"),
                    None => "export already failed".to_string(),
                };
                Err(Error::new(kind)
                    .with_message(message)
                    .with_input(self.invocation.to_string()))
            }
        }
    }

    async fn start(&mut self) -> Result<(), Error> {
        self.state = SessionState::Dispatching;
        info!(command = %self.invocation, mode = %self.mode, "starting export");
        match self.backend.spawn(&self.invocation).await {
            Ok(Spawned { stdout, process }) => {
                debug!(pid = process.id(), "export streaming");
                self.running = Some(Running {
                    decoder: Decoder::new(self.encoding, stdout),
                    process,
                });
                self.state = SessionState::Streaming;
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Output closed cleanly; settle on the exit status.
    async fn finish(&mut self) -> Result<(), Error> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        let report = match running.process.wait().await {
            Ok(report) => report,
            Err(err) => return Err(self.fail(err)),
        };
        let stderr = report.stderr.clone();
        if let Err(err) = report.check(&self.invocation) {
            return Err(self.fail(err));
        }
        if !self.mode.is_finite() && self.max_events.is_none() {
            return Err(self.fail(
                Error::new(ErrorKind::Execution)
                    .with_message(format!("engine ended a {} export", self.mode))
                    .with_input(self.invocation.to_string())
                    .with_stderr(stderr),
            ));
        }
        self.state = SessionState::Completed;
        info!(delivered = self.delivered, "export completed");
        Ok(())
    }

    /// Decoding failed mid-stream; stop the engine and fail the session.
    async fn abort(&mut self, err: Error) -> Error {
        let mut err = err;
        if let Some(running) = self.running.take() {
            let Running {
                decoder,
                mut process,
            } = running;
            drop(decoder);
            match process.terminate(self.grace).await {
                Ok(report) if err.stderr().is_none() => err = err.with_stderr(report.stderr),
                Ok(_) => {}
                Err(terminate_err) => {
                    warn!(error = %terminate_err, "failed to terminate engine after decode error")
                }
            }
        }
        self.fail(err)
    }

    fn fail(&mut self, err: Error) -> Error {
        self.state = SessionState::Failed(err.kind());
        self.failure = Some(err.to_string());
        warn!(error = %err, "export failed");
        err
    }
}

impl Drop for ExportSession {
    fn drop(&mut self) {
        let Some(Running {
            decoder,
            mut process,
        }) = self.running.take()
        else {
            return;
        };
        drop(decoder);
        let grace = self.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(pid = process.id(), "tearing down dropped export");
                handle.spawn(async move {
                    if let Err(err) = process.terminate(grace).await {
                        warn!(error = %err, "failed to terminate dropped export");
                    }
                });
            }
            // Outside a runtime the child is killed when its handle drops.
            Err(_) => drop(process),
        }
    }
}

/// Record stream backed by a pumping task; dropping it cancels the export.
pub struct RecordStream {
    inner: ReceiverStream<Result<Record, Error>>,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RecordStream {
    /// Stops the export and waits until the engine process is gone.
    pub async fn cancel(mut self) -> Result<(), Error> {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("export task failed")
                    .with_source(err)
            })?;
        }
        Ok(())
    }
}

impl Stream for RecordStream {
    type Item = Result<Record, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
