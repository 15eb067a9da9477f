//! Purpose: Incrementally decode engine stdout into records and schema-tagged batches.
//! Exports: `Record`, `SchemaBatch`, `Decoder`, `JsonLinesDecoder`, `ArrowDecoder`.
//! Role: Stream decoder between the process driver and export sessions.
//! Invariants: Decoders only read when asked for the next item (pull-based).
//! Invariants: A malformed unit fails with `Protocol` and the raw unit attached;
//!             nothing is skipped silently.
#![allow(clippy::result_large_err)]

mod arrow_ipc;
mod jsonl;
mod value;

pub use arrow_ipc::{ArrowDecoder, schema_name};
pub use jsonl::JsonLinesDecoder;
pub use value::cell_value;

use crate::core::error::{Error, ErrorKind};
use crate::core::invocation::Encoding;
use crate::core::process::EngineOutput;
use arrow::record_batch::RecordBatch;
use serde_json::{Map, Value, json};

/// One decoded event: an optional schema name plus its fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    schema: Option<String>,
    data: Map<String, Value>,
}

impl Record {
    pub fn new(schema: Option<String>, data: Map<String, Value>) -> Self {
        Self { schema, data }
    }

    /// Schema name, e.g. `suricata.alert`. JSON-lines output carries none.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn into_data(self) -> Map<String, Value> {
        self.data
    }

    pub fn to_json(&self) -> Value {
        json!({
            "schema": self.schema,
            "data": Value::Object(self.data.clone()),
        })
    }
}

/// An Arrow record batch tagged with the engine schema it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct SchemaBatch {
    name: String,
    batch: RecordBatch,
}

impl SchemaBatch {
    pub fn new(name: impl Into<String>, batch: RecordBatch) -> Self {
        Self {
            name: name.into(),
            batch,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn into_parts(self) -> (String, RecordBatch) {
        (self.name, self.batch)
    }
}

/// Decoder over a live engine output stream, selected by encoding.
pub enum Decoder {
    Json(JsonLinesDecoder<EngineOutput>),
    Arrow(ArrowDecoder<EngineOutput>),
}

impl Decoder {
    pub fn new(encoding: Encoding, output: EngineOutput) -> Self {
        match encoding {
            Encoding::Json => Decoder::Json(JsonLinesDecoder::new(output)),
            Encoding::Arrow => Decoder::Arrow(ArrowDecoder::new(output)),
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Decoder::Json(_) => Encoding::Json,
            Decoder::Arrow(_) => Encoding::Arrow,
        }
    }

    pub async fn next_record(&mut self) -> Result<Option<Record>, Error> {
        match self {
            Decoder::Json(decoder) => decoder.next_record().await,
            Decoder::Arrow(decoder) => decoder.next_record().await,
        }
    }

    pub async fn next_batch(&mut self) -> Result<Option<SchemaBatch>, Error> {
        match self {
            Decoder::Json(_) => Err(Error::new(ErrorKind::Usage)
                .with_message("batches are only available for arrow exports")
                .with_hint("Request Encoding::Arrow to read schema-tagged batches.")),
            Decoder::Arrow(decoder) => decoder.next_batch().await,
        }
    }
}

pub(crate) fn protocol_error(message: impl Into<String>, raw: &[u8]) -> Error {
    Error::new(ErrorKind::Protocol)
        .with_message(message)
        .with_raw(raw.to_vec())
}

pub(crate) fn read_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to read engine output")
        .with_source(err)
}
