//! Replication stream: wire framing and history replay.
//!
//! A secondary opens `GET /v1/replication/stream` with `since=<name>:<offset>`
//! parameters and reads NDJSON events until it disconnects. On the primary
//! side, [`stream_history`] is the catch-up half an HTTP adapter calls
//! before forwarding live bus events: it replays a collection's log,
//! stamping each command with its byte offset and skipping everything the
//! secondary already holds.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};

use bytes::BytesMut;
use nestdb_common::{NestError, Result};

use crate::collection::{Collection, Command};

use super::bus::Event;
use super::http::{self, BodyReader};

/// Path served by the primary.
pub const STREAM_PATH: &str = "/v1/replication/stream";

/// Parse `since` query values of the form `<collection>:<offset>`. The
/// largest offset wins when a collection repeats.
pub fn parse_since(values: &[String]) -> Result<HashMap<String, i64>> {
    let mut offsets = HashMap::with_capacity(values.len());
    for value in values {
        let (name, offset_text) = value.rsplit_once(':').ok_or_else(|| {
            NestError::MalformedJson(format!("invalid since token '{value}'"))
        })?;
        let offset: i64 = offset_text
            .parse()
            .map_err(|_| NestError::MalformedJson(format!("invalid offset for '{name}'")))?;
        let entry = offsets.entry(name.to_string()).or_insert(offset);
        if offset > *entry {
            *entry = offset;
        }
    }
    Ok(offsets)
}

/// Build the request path with `since` parameters for positive offsets.
pub fn stream_path(since: &HashMap<String, i64>) -> String {
    let mut names: Vec<&String> = since
        .iter()
        .filter(|(_, offset)| **offset > 0)
        .map(|(name, _)| name)
        .collect();
    names.sort();

    let mut path = String::from(STREAM_PATH);
    for (i, name) in names.iter().enumerate() {
        path.push(if i == 0 { '?' } else { '&' });
        path.push_str("since=");
        path.push_str(&http::encode_query_component(&format!(
            "{name}:{}",
            since[*name]
        )));
    }
    path
}

/// Replay a collection's log as replication events.
///
/// Each command is stamped with the byte offset its encoding starts at
/// (already-stamped commands keep their value); commands below `since`
/// are skipped. The emitter returns false to stop early.
pub fn stream_history(
    collection: &Collection,
    since: i64,
    emit: &mut dyn FnMut(Event) -> bool,
) -> Result<()> {
    let mut reader = BufReader::new(collection.log_reader()?);
    let mut line = String::new();
    let mut offset = 0i64;
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(NestError::read_failed)?;
        if n == 0 {
            return Ok(());
        }
        let start = offset;
        offset += n as i64;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut command: Command = serde_json::from_str(trimmed)?;
        if command.start_byte == 0 {
            command.start_byte = start;
        }
        if since > 0 && command.start_byte < since {
            continue;
        }

        let event = Event {
            collection: collection.name().to_string(),
            command: serde_json::value::to_raw_value(&command)?,
        };
        if !emit(event) {
            return Ok(());
        }
    }
}

/// A live NDJSON event stream from a primary.
pub struct EventStream {
    body: BodyReader,
    pending: BytesMut,
}

impl EventStream {
    /// Connect to a primary and open the replication stream.
    pub async fn open(primary_url: &str, since: &HashMap<String, i64>) -> Result<Self> {
        let authority = http::parse_authority(primary_url)?;
        let path = stream_path(since);
        let headers = vec![(
            "Accept".to_string(),
            "application/x-ndjson".to_string(),
        )];

        let (head, mut body) = http::request(&authority, "GET", &path, &headers, b"").await?;
        if head.status != 200 {
            let snippet = body.read_to_end().await.unwrap_or_default();
            let snippet = String::from_utf8_lossy(&snippet[..snippet.len().min(1024)]).into_owned();
            return Err(NestError::Network(format!(
                "replication stream failed with status {}: {}",
                head.status,
                snippet.trim()
            )));
        }

        Ok(Self {
            body,
            pending: BytesMut::new(),
        })
    }

    /// Next event, or None when the primary disconnects.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            if let Some(at) = self.pending.iter().position(|b| *b == b'\n') {
                let line = self.pending.split_to(at + 1);
                let text = std::str::from_utf8(&line[..at])
                    .map_err(|_| NestError::MalformedJson("event is not utf-8".into()))?
                    .trim();
                if text.is_empty() {
                    continue;
                }
                let event: Event = serde_json::from_str(text)?;
                return Ok(Some(event));
            }

            let bytes = self.body.next_decoded().await?;
            if bytes.is_empty() {
                return Ok(None);
            }
            self.pending.extend_from_slice(&bytes);
        }
    }
}
