//! Newline-delimited JSON input.
//!
//! Each line is a JSON object. Values are kept as strings the way they
//! appear on the wire; numbers and booleans are rendered back to text and
//! nulls are dropped.

use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::engine::Record;

/// Parse one input line. Blank lines yield `None`.
pub fn parse_record(line: &str) -> Result<Option<Record>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let object: Map<String, Value> = serde_json::from_str(line)?;
    let record = object
        .into_iter()
        .filter_map(|(name, value)| {
            let text = match value {
                Value::Null => return None,
                Value::String(s) => s,
                other => other.to_string(),
            };
            Some((name, text))
        })
        .collect();
    Ok(Some(record))
}

/// Read lines from `reader`, forwarding each parsed record in order. Stops
/// early if the receiving side has gone away. Returns the number of lines
/// that could not be parsed.
pub async fn forward_records<R>(reader: R, tx: mpsc::Sender<Record>) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_number = 0u64;
    let mut bad_lines = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        match parse_record(&line) {
            Ok(Some(record)) => {
                if tx.send(record).await.is_err() {
                    trace!(line_number, "engine stopped; no longer reading input");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                bad_lines += 1;
                error!(line_number, error = %e, "input line is not a JSON object; skipped");
            }
        }
    }
    Ok(bad_lines)
}
