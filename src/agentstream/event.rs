//! Event model: the typed, immutable documents that make up a stream.
//!
//! Clients append an [`EventInput`]; the storage layer stamps it with the
//! path, the next [`Offset`], a `createdAt` timestamp and a trace context,
//! producing an [`Event`]. Events are never mutated or deleted afterwards.
//!
//! Event types are namespaced dotted/colon-separated strings (for example
//! `codemode:code-eval-done`). The well-known names the runtime emits and
//! consumes live in [`types`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agentstream::offset::Offset;

/// The identifier of one log, typically one conversational session
/// (e.g. `"agent/session-123"`). Opaque and non-empty; different paths are
/// fully independent.
pub type StreamPath = String;

/// Distributed tracing identifiers carried by every event.
///
/// Processors that react to an event must propagate its `trace_id` and set
/// `parent_span_id` to the triggering event's `span_id`; client-initiated
/// appends open a fresh `trace_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Open a new root trace (client-initiated append).
    pub fn root() -> Self {
        TraceContext {
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            span_id: uuid::Uuid::new_v4().simple().to_string(),
            parent_span_id: None,
        }
    }

    /// A child span within the same trace, parented on this span.
    pub fn child(&self) -> Self {
        TraceContext {
            trace_id: self.trace_id.clone(),
            span_id: uuid::Uuid::new_v4().simple().to_string(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }
}

/// What a client (or a reacting processor) hands to `append`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInput {
    /// Namespaced event type, e.g. `"agent:action:send-user-message:called"`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Type-determined JSON payload.
    pub payload: serde_json::Value,
    /// Optional payload schema version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Trace context to record. Absent on root appends; the storage layer
    /// opens a fresh trace in that case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

impl EventInput {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        EventInput {
            event_type: event_type.into(),
            payload,
            version: None,
            trace: None,
        }
    }

    /// Attach an explicit trace context (used by reacting processors).
    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }
}

/// A stored, immutable event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// The path this event belongs to.
    pub path: StreamPath,
    /// Position within the path, assigned at append time.
    pub offset: Offset,
    /// Namespaced event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Type-determined JSON payload.
    pub payload: serde_json::Value,
    /// Optional payload schema version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Append timestamp (ISO-8601 on the wire).
    pub created_at: DateTime<Utc>,
    /// Trace identifiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

impl Event {
    /// Build the input for an event emitted in reaction to this one,
    /// propagating the trace with a child span.
    pub fn reaction(&self, event_type: impl Into<String>, payload: serde_json::Value) -> EventInput {
        let trace = self
            .trace
            .as_ref()
            .map(TraceContext::child)
            .unwrap_or_else(TraceContext::root);
        EventInput::new(event_type, payload).with_trace(trace)
    }

    /// Payload field accessor for the common string case.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Payload field accessor for offsets encoded as zero-padded strings.
    pub fn payload_offset(&self, key: &str) -> Option<Offset> {
        self.payload_str(key).and_then(|s| Offset::parse(s).ok())
    }
}

/// Well-known event type names.
pub mod types {
    // Client inputs.
    pub const CONFIG_SET: &str = "agent:config:set";
    pub const USER_MESSAGE: &str = "agent:action:send-user-message:called";
    pub const USER_AUDIO: &str = "agent:action:send-user-audio:called";

    // LLM loop outputs.
    pub const REQUEST_STARTED: &str = "llm-loop:request-started";
    pub const RESPONSE_SSE: &str = "llm-loop:response:sse";
    pub const REQUEST_ENDED: &str = "llm-loop:request-ended";
    pub const REQUEST_CANCELLED: &str = "llm-loop:request-cancelled";
    pub const REQUEST_INTERRUPTED: &str = "llm-loop:request-interrupted";
    pub const SYSTEM_PROMPT_EDIT: &str = "llm-loop:system-prompt-edit";

    // Codemode inputs and outputs.
    pub const TOOL_REGISTERED: &str = "codemode:tool-registered";
    pub const TOOL_UNREGISTERED: &str = "codemode:tool-unregistered";
    pub const CODE_BLOCK_ADDED: &str = "codemode:code-block-added";
    pub const CODE_EVAL_STARTED: &str = "codemode:code-eval-started";
    pub const CODE_EVAL_DONE: &str = "codemode:code-eval-done";
    pub const CODE_EVAL_FAILED: &str = "codemode:code-eval-failed";
    pub const DEFERRED_BLOCK_ADDED: &str = "codemode:deferred-block-added";
    pub const DEFERRED_CANCELLED: &str = "codemode:deferred-cancelled";
    pub const DEFERRED_POLL_ATTEMPTED: &str = "codemode:deferred-poll-attempted";
    pub const DEFERRED_COMPLETED: &str = "codemode:deferred-completed";
    pub const DEFERRED_FAILED: &str = "codemode:deferred-failed";
    pub const DEFERRED_TIMED_OUT: &str = "codemode:deferred-timed-out";

    /// Fed back into the LLM loop's history as conversational context.
    pub const DEVELOPER_MESSAGE: &str = "developer-message";

    /// Emitted by the clock processor while deferred blocks are outstanding.
    pub const TIME_TICK: &str = "clock:time-tick";
}
