use super::{Record, protocol_error, read_error};
use crate::core::error::Error;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Line-delimited JSON: one object per line, blank lines ignored.
pub struct JsonLinesDecoder<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    line_no: u64,
}

impl<R: AsyncRead + Unpin> JsonLinesDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
            line_no: 0,
        }
    }

    pub async fn next_record(&mut self) -> Result<Option<Record>, Error> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.line)
                .await
                .map_err(read_error)?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let unit = self.line.trim_ascii();
            if unit.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_slice(unit).map_err(|err| {
                protocol_error(format!("malformed json on line {}", self.line_no), unit)
                    .with_source(err)
            })?;
            return match value {
                Value::Object(data) => Ok(Some(Record::new(None, data))),
                _ => Err(protocol_error(
                    format!("json on line {} is not an object", self.line_no),
                    unit,
                )),
            };
        }
    }
}
