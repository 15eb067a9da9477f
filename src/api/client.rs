//! Purpose: Public entry point for talking to one engine node.
//! Exports: `Client`, `ClientConfig`, `ApiResult`.
//! Role: Facade that builds invocations and hands them to the process driver.
//! Invariants: A client is read-only after construction and cheap to clone.
//! Invariants: `export` never launches a process; the session does on first read.
#![allow(clippy::result_large_err)]

use super::session::ExportSession;
use crate::core::endpoint::Endpoint;
use crate::core::error::{Error, ErrorKind};
use crate::core::invocation::{
    CommandSyntax, DEFAULT_PROGRAM, ExportRequest, Invocation, Query, TenzirCtl,
};
use crate::core::process::{Backend, ProcessBackend, run_to_completion};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub type ApiResult<T> = Result<T, Error>;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_COUNT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientConfig {
    /// Control program to execute, looked up on `PATH` when relative.
    pub program: PathBuf,
    /// Bound for `test_connection` and `status`.
    pub probe_timeout: Duration,
    /// Bound for `count`.
    pub count_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when tearing a process down.
    pub grace_period: Duration,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            count_timeout: DEFAULT_COUNT_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_count_timeout(mut self, timeout: Duration) -> Self {
        self.count_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Clone, Debug)]
struct ClientInner {
    endpoint: Endpoint,
    config: ClientConfig,
    syntax: Option<Arc<dyn CommandSyntax>>,
    backend: Arc<dyn Backend>,
}

impl Client {
    pub fn new(endpoint: impl AsRef<str>) -> ApiResult<Self> {
        Ok(Self::for_endpoint(Endpoint::parse(endpoint.as_ref())?))
    }

    pub fn for_endpoint(endpoint: Endpoint) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                endpoint,
                config: ClientConfig::new(),
                syntax: None,
                backend: Arc::new(ProcessBackend::new()),
            }),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        Arc::make_mut(&mut self.inner).config.program = program.into();
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        Arc::make_mut(&mut self.inner).config = config;
        self
    }

    pub fn with_backend(mut self, backend: impl Backend + 'static) -> Self {
        Arc::make_mut(&mut self.inner).backend = Arc::new(backend);
        self
    }

    /// Replaces the `tenzir-ctl` dialect; the configured program is then unused.
    pub fn with_syntax(mut self, syntax: impl CommandSyntax + 'static) -> Self {
        Arc::make_mut(&mut self.inner).syntax = Some(Arc::new(syntax));
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Reports whether the node answers a status request in time.
    pub async fn test_connection(&self) -> bool {
        let invocation = self.command(|syntax, endpoint| syntax.status(endpoint));
        match self.run(&invocation, self.inner.config.probe_timeout).await {
            Ok(_) => true,
            Err(err) => {
                debug!(endpoint = %self.inner.endpoint, error = %err, "connection probe failed");
                false
            }
        }
    }

    pub async fn status(&self) -> ApiResult<Value> {
        let invocation = self.command(|syntax, endpoint| syntax.status(endpoint));
        let out = self.run(&invocation, self.inner.config.probe_timeout).await?;
        serde_json::from_slice(&out).map_err(|err| {
            Error::new(ErrorKind::Protocol)
                .with_message("engine status is not valid json")
                .with_input(invocation.to_string())
                .with_raw(out.clone())
                .with_source(err)
        })
    }

    pub async fn count(&self, query: &Query) -> ApiResult<u64> {
        let invocation = self.command(|syntax, endpoint| syntax.count(endpoint, query));
        let out = self.run(&invocation, self.inner.config.count_timeout).await?;
        parse_count(&out).map_err(|err| err.with_input(query.expression()))
    }

    pub fn export(&self, request: ExportRequest) -> ExportSession {
        let invocation = self.command(|syntax, endpoint| syntax.export(endpoint, &request));
        ExportSession::new(
            self.inner.backend.clone(),
            invocation,
            &request,
            self.inner.config.grace_period,
        )
    }

    fn command<T>(&self, build: impl FnOnce(&dyn CommandSyntax, &Endpoint) -> T) -> T {
        let inner = &self.inner;
        match &inner.syntax {
            Some(syntax) => build(syntax.as_ref(), &inner.endpoint),
            None => build(&TenzirCtl::new(&inner.config.program), &inner.endpoint),
        }
    }

    async fn run(&self, invocation: &Invocation, timeout: Duration) -> ApiResult<Vec<u8>> {
        run_to_completion(
            self.inner.backend.as_ref(),
            invocation,
            timeout,
            self.inner.config.grace_period,
        )
        .await
    }
}

fn parse_count(out: &[u8]) -> ApiResult<u64> {
    std::str::from_utf8(out)
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            Error::new(ErrorKind::Protocol)
                .with_message("engine count output is not an integer")
                .with_raw(out.to_vec())
        })
}
