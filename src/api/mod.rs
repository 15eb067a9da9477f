//! Purpose: Public Rust API for querying a Tenzir node.
//! Exports: Client, export sessions, record streams, tables, and the core
//!          types callers need to build requests and inspect errors.
//! Role: Stable, additive-only surface used by the CLI and embedders.
//! Invariants: Process and decoder internals stay behind `ExportSession`.

mod client;
mod session;
mod tables;

pub use crate::core::decode::{Record, SchemaBatch};
pub use crate::core::endpoint::Endpoint;
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::invocation::{
    CommandSyntax, Encoding, ExportMode, ExportRequest, Invocation, Query, TenzirCtl,
};
pub use crate::core::predicate::{DataType, Predicate};
pub use crate::core::process::{Backend, EngineProcess, ProcessBackend};
pub use client::{
    ApiResult, Client, ClientConfig, DEFAULT_COUNT_TIMEOUT, DEFAULT_GRACE_PERIOD,
    DEFAULT_PROBE_TIMEOUT,
};
pub use session::{ExportSession, RecordStream, SessionState};
pub use tables::{CollectBound, Tables, collect_tables};
