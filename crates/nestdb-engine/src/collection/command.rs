//! Command records: one JSON object per log line.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use nestdb_common::Result;

// Command names as they appear on disk and on the wire.
pub const CMD_INSERT: &str = "insert";
pub const CMD_REMOVE: &str = "remove";
pub const CMD_PATCH: &str = "patch";
pub const CMD_CREATE_INDEX: &str = "index";
pub const CMD_DROP_INDEX: &str = "drop_index";
pub const CMD_SET_DEFAULTS: &str = "set_defaults";

/// A persisted, replicated record describing one state change.
///
/// `start_byte` is the offset in the collection log where this command's
/// encoding begins; it is stamped at persist time and re-stamped when a
/// primary replays history for a secondary.
#[derive(Debug, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub uuid: String,
    pub timestamp: i64,
    pub start_byte: i64,
    pub payload: Box<RawValue>,
}

impl Command {
    /// Build a command for `name` carrying pre-encoded payload bytes.
    pub fn new(name: &str, payload: Box<RawValue>) -> Self {
        Self {
            name: name.to_string(),
            uuid: uuid::Uuid::new_v4().to_string(),
            timestamp: unix_nanos(),
            start_byte: 0,
            payload,
        }
    }

    /// Encode as a single log line, newline-terminated.
    pub fn encode_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Payload of a `remove` command: the row's position at removal time.
#[derive(Debug, Serialize, Deserialize)]
pub struct RemovePayload {
    pub i: usize,
}

/// Payload of a `patch` command: position plus the minimal merge-patch diff.
#[derive(Debug, Serialize, Deserialize)]
pub struct PatchPayload {
    pub i: usize,
    pub diff: Box<RawValue>,
}

/// Payload of an `index` (create) command.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateIndexPayload {
    pub name: String,
    #[serde(rename = "type")]
    pub index_type: String,
    pub options: serde_json::Value,
}

/// Payload of a `drop_index` command.
#[derive(Debug, Serialize, Deserialize)]
pub struct DropIndexPayload {
    pub name: String,
}

/// Current time in nanoseconds since the Unix epoch.
pub fn unix_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
