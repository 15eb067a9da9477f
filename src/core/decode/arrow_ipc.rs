use super::{Record, SchemaBatch, cell_value, protocol_error, read_error};
use crate::core::error::Error;
use arrow::buffer::Buffer;
use arrow::datatypes::Schema;
use arrow::ipc::reader::StreamDecoder;
use arrow::record_batch::RecordBatch;
use serde_json::Map;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

const CONTINUATION: [u8; 4] = [0xff; 4];
const MAX_METADATA_BYTES: usize = 64 * 1024 * 1024;
const MAX_BODY_BYTES: i64 = 1 << 31;

/// Schema metadata keys carrying the engine schema name, newest first.
const SCHEMA_NAME_KEYS: [&str; 2] = ["TENZIR:name:0", "VAST:name:0"];

/// Engine schema name stored in Arrow schema metadata.
pub fn schema_name(schema: &Schema) -> Option<&str> {
    SCHEMA_NAME_KEYS
        .iter()
        .find_map(|key| schema.metadata().get(*key))
        .map(String::as_str)
        .filter(|name| !name.is_empty())
}

enum Frame {
    Message(Vec<u8>),
    EndOfStream,
}

/// Decodes concatenated Arrow IPC streams, one stream per schema run.
///
/// Messages are framed here so that a bad message surfaces with its raw bytes,
/// and so each end-of-stream marker can reset the inner decoder for the next
/// schema.
pub struct ArrowDecoder<R> {
    reader: BufReader<R>,
    decoder: StreamDecoder,
    current: Option<SchemaBatch>,
    row: usize,
}

impl<R: AsyncRead + Unpin> ArrowDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            decoder: StreamDecoder::new(),
            current: None,
            row: 0,
        }
    }

    /// Next batch, or the unread remainder of a batch partly consumed by
    /// `next_record`.
    pub async fn next_batch(&mut self) -> Result<Option<SchemaBatch>, Error> {
        if let Some(rest) = self.take_remaining() {
            return Ok(Some(rest));
        }
        self.read_batch().await
    }

    pub async fn next_record(&mut self) -> Result<Option<Record>, Error> {
        loop {
            if let Some(current) = &self.current {
                if self.row < current.num_rows() {
                    let record = row_record(current, self.row)?;
                    self.row += 1;
                    return Ok(Some(record));
                }
                self.current = None;
            }
            match self.read_batch().await? {
                Some(batch) => {
                    self.current = Some(batch);
                    self.row = 0;
                }
                None => return Ok(None),
            }
        }
    }

    fn take_remaining(&mut self) -> Option<SchemaBatch> {
        let current = self.current.take()?;
        let remaining = current.num_rows().saturating_sub(self.row);
        if remaining == 0 {
            return None;
        }
        let offset = self.row;
        self.row = 0;
        let (name, batch) = current.into_parts();
        Some(SchemaBatch::new(name, batch.slice(offset, remaining)))
    }

    async fn read_batch(&mut self) -> Result<Option<SchemaBatch>, Error> {
        loop {
            let frame = match self.read_frame().await? {
                None => return Ok(None),
                Some(Frame::EndOfStream) => {
                    self.decoder = StreamDecoder::new();
                    continue;
                }
                Some(Frame::Message(frame)) => frame,
            };

            let message = Buffer::from_vec(frame);
            let mut cursor = message.clone();
            match self.decoder.decode(&mut cursor) {
                Ok(Some(batch)) => return tag_batch(batch, message.as_slice()).map(Some),
                // Schema and dictionary messages carry no rows.
                Ok(None) => continue,
                Err(err) => {
                    return Err(protocol_error("undecodable arrow ipc message", message.as_slice())
                        .with_source(err));
                }
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        let mut prefix = [0u8; 4];
        match fill(&mut self.reader, &mut prefix).await? {
            0 => return Ok(None),
            4 => {}
            n => return Err(protocol_error("truncated arrow ipc message header", &prefix[..n])),
        }

        let mut header = prefix.to_vec();
        let length = if prefix == CONTINUATION {
            let mut length = [0u8; 4];
            let n = fill(&mut self.reader, &mut length).await?;
            header.extend_from_slice(&length[..n]);
            if n < 4 {
                return Err(protocol_error("truncated arrow ipc message header", &header));
            }
            length
        } else {
            // Pre-1.0 framing: the length comes without a continuation marker.
            prefix
        };

        let metadata_len = i32::from_le_bytes(length);
        if metadata_len == 0 {
            return Ok(Some(Frame::EndOfStream));
        }
        if metadata_len < 0 || metadata_len as usize > MAX_METADATA_BYTES {
            return Err(protocol_error(
                format!("invalid arrow ipc metadata length {metadata_len}"),
                &header,
            ));
        }

        let metadata_len = metadata_len as usize;
        let mut frame = Vec::with_capacity(8 + metadata_len);
        frame.extend_from_slice(&CONTINUATION);
        frame.extend_from_slice(&length);
        self.extend_frame(&mut frame, metadata_len).await?;

        let body_len = match arrow::ipc::root_as_message(&frame[8..]) {
            Ok(message) => message.bodyLength(),
            Err(err) => {
                return Err(protocol_error(
                    format!("invalid arrow ipc message metadata: {err}"),
                    &frame,
                ));
            }
        };
        if !(0..=MAX_BODY_BYTES).contains(&body_len) {
            return Err(protocol_error(
                format!("invalid arrow ipc body length {body_len}"),
                &frame,
            ));
        }
        self.extend_frame(&mut frame, body_len as usize).await?;
        Ok(Some(Frame::Message(frame)))
    }

    async fn extend_frame(&mut self, frame: &mut Vec<u8>, len: usize) -> Result<(), Error> {
        let start = frame.len();
        frame.resize(start + len, 0);
        let read = fill(&mut self.reader, &mut frame[start..]).await?;
        if read < len {
            frame.truncate(start + read);
            return Err(protocol_error("truncated arrow ipc message", frame));
        }
        Ok(())
    }
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await.map_err(read_error)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn tag_batch(batch: RecordBatch, raw: &[u8]) -> Result<SchemaBatch, Error> {
    let name = match schema_name(batch.schema_ref()) {
        Some(name) => name.to_string(),
        None => {
            return Err(protocol_error("arrow batch carries no schema name", raw)
                .with_hint("Expected TENZIR:name:0 in the schema metadata."));
        }
    };
    Ok(SchemaBatch::new(name, batch))
}

fn row_record(batch: &SchemaBatch, row: usize) -> Result<Record, Error> {
    let inner = batch.batch();
    let mut data = Map::with_capacity(inner.num_columns());
    for (field, column) in inner.schema_ref().fields().iter().zip(inner.columns()) {
        data.insert(field.name().clone(), cell_value(field, column.as_ref(), row)?);
    }
    Ok(Record::new(Some(batch.name().to_string()), data))
}
