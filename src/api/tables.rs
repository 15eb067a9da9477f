//! Purpose: Gather an Arrow export into per-schema tables.
//! Exports: `Tables`, `CollectBound`, `collect_tables`.
//! Role: Convenience layer over `ExportSession::next_batch`.
//! Invariants: Unbounded collection is only allowed for sessions that finish
//!             on their own (historical mode).
#![allow(clippy::result_large_err)]

use super::session::ExportSession;
use crate::core::decode::SchemaBatch;
use crate::core::error::{Error, ErrorKind};
use crate::core::invocation::Encoding;
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Batches grouped by schema name.
#[derive(Clone, Debug, Default)]
pub struct Tables {
    tables: BTreeMap<String, Vec<RecordBatch>>,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, batch: SchemaBatch) {
        let (name, batch) = batch.into_parts();
        self.tables.entry(name).or_default().push(batch);
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn schemas(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn batches(&self, schema: &str) -> Option<&[RecordBatch]> {
        self.tables.get(schema).map(Vec::as_slice)
    }

    pub fn num_rows(&self, schema: &str) -> usize {
        self.batches(schema)
            .map(|batches| batches.iter().map(RecordBatch::num_rows).sum())
            .unwrap_or(0)
    }

    pub fn total_rows(&self) -> usize {
        self.tables
            .values()
            .flatten()
            .map(RecordBatch::num_rows)
            .sum()
    }

    /// All batches of one schema merged into a single batch.
    pub fn concat(&self, schema: &str) -> Result<Option<RecordBatch>, Error> {
        let Some(batches) = self.tables.get(schema) else {
            return Ok(None);
        };
        let Some(first) = batches.first() else {
            return Ok(None);
        };
        concat_batches(first.schema_ref(), batches)
            .map(Some)
            .map_err(|err| {
                Error::new(ErrorKind::Protocol)
                    .with_message(format!("batches of schema {schema} do not line up"))
                    .with_input(schema)
                    .with_source(err)
            })
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<RecordBatch>> {
        self.tables
    }
}

/// Limits for `collect_tables`; whichever is hit first ends collection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CollectBound {
    pub max_rows: Option<usize>,
    pub timeout: Option<Duration>,
}

impl CollectBound {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn max_rows(mut self, rows: usize) -> Self {
        self.max_rows = Some(rows);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_rows.is_none() && self.timeout.is_none()
    }
}

/// Reads batches until the session completes or a bound is reached.
///
/// Reaching a bound cancels the session. Continuous and unified sessions
/// never complete on their own, so they need a bound.
pub async fn collect_tables(
    session: &mut ExportSession,
    bound: CollectBound,
) -> Result<Tables, Error> {
    if session.encoding() != Encoding::Arrow {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("tables require an arrow export")
            .with_hint("Build the request with Encoding::Arrow."));
    }
    if !session.mode().is_finite() && bound.is_unbounded() && session.max_events().is_none() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!(
                "collecting a {} export needs max_rows, timeout, or max_events",
                session.mode()
            ))
            .with_hint("Set CollectBound::max_rows or CollectBound::timeout."));
    }

    let deadline = bound.timeout.map(|timeout| Instant::now() + timeout);
    let mut tables = Tables::new();
    let mut rows = 0usize;
    loop {
        if bound.max_rows.is_some_and(|max| rows >= max) {
            debug!(rows, "row bound reached");
            session.cancel().await?;
            break;
        }
        let next = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, session.next_batch()).await {
                    Ok(next) => next?,
                    Err(_) => {
                        debug!(rows, "collection timeout reached");
                        session.cancel().await?;
                        break;
                    }
                }
            }
            None => session.next_batch().await?,
        };
        let Some(batch) = next else {
            break;
        };
        let batch = match bound.max_rows {
            Some(max) if rows + batch.num_rows() > max => {
                let keep = max - rows;
                let (name, inner) = batch.into_parts();
                SchemaBatch::new(name, inner.slice(0, keep))
            }
            _ => batch,
        };
        rows += batch.num_rows();
        tables.push(batch);
    }
    Ok(tables)
}
