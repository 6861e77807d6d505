//! Error taxonomy for the event log substrate and the processor framework.
//!
//! Errors that can be represented as log events (evaluation throws, adapter
//! failures, interrupts) never surface through this type; they are recorded
//! as events by the processor that observed them. `StreamError` covers the
//! remainder: storage failures, subscription backpressure, and malformed
//! client input.

use std::error::Error;
use std::fmt;

/// Errors raised by [`StreamStorage`](crate::agentstream::storage::StreamStorage),
/// [`EventStream`](crate::agentstream::stream::EventStream) and the processor
/// framework.
#[derive(Debug)]
pub enum StreamError {
    /// Underlying persistence failed during an append or read.
    StorageIo(String),
    /// An event document could not be serialized or deserialized.
    Serialization(String),
    /// A subscriber fell behind the live fan-out and was dropped.
    /// The log itself is unaffected; resubscribe from the last processed
    /// offset to continue.
    BackpressureDrop,
    /// A client-supplied offset string could not be parsed.
    InvalidOffset(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::StorageIo(msg) => write!(f, "storage io error: {}", msg),
            StreamError::Serialization(msg) => write!(f, "serialization error: {}", msg),
            StreamError::BackpressureDrop => {
                write!(f, "subscriber dropped: live queue overflowed")
            }
            StreamError::InvalidOffset(s) => write!(f, "invalid offset: {:?}", s),
        }
    }
}

impl Error for StreamError {}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::StorageIo(e.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}
