//! Deferred blocks: codemode scripts re-evaluated on clock ticks until
//! they yield a truthy value, fail, time out, or are cancelled.

use serde_json::Value;

use crate::agentstream::event::Event;
use crate::agentstream::offset::Offset;

/// State of one outstanding deferred block. Identity is the offset of the
/// `deferred-block-added` event that registered it.
#[derive(Debug, Clone)]
pub struct DeferredBlock {
    pub block_offset: Offset,
    pub code: String,
    pub check_interval_seconds: u64,
    pub max_attempts: u32,
    pub description: String,
    pub attempt_count: u32,
    pub last_poll_elapsed_seconds: u64,
}

impl DeferredBlock {
    /// Build the block from its registration event. `elapsed_seconds` is
    /// the path's current elapsed time, so the first poll waits one full
    /// check interval.
    pub fn from_event(event: &Event, elapsed_seconds: u64) -> Option<DeferredBlock> {
        Some(DeferredBlock {
            block_offset: event.offset,
            code: event.payload_str("code")?.to_string(),
            check_interval_seconds: event.payload["checkIntervalSeconds"].as_u64().unwrap_or(60),
            max_attempts: event.payload["maxAttempts"].as_u64().unwrap_or(10) as u32,
            description: event.payload_str("description").unwrap_or_default().to_string(),
            attempt_count: 0,
            last_poll_elapsed_seconds: elapsed_seconds,
        })
    }

    /// Whether the block is due at `elapsed_seconds`.
    pub fn due(&self, elapsed_seconds: u64) -> bool {
        elapsed_seconds >= self.last_poll_elapsed_seconds + self.check_interval_seconds
    }
}

/// JSON truthiness for a deferred block's result: `null`, `false`, `0`,
/// `""`, `[]` and `{}` are falsy, everything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
