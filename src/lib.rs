// src/lib.rs

// Import the top-level `agentstream` module.
pub mod agentstream;

// Re-exporting key items for easier external access.
pub use agentstream::clock::ClockProcessor;
pub use agentstream::codemode::sandbox::{Capabilities, CodeEvaluator, RegisteredTool, Sandbox};
pub use agentstream::codemode::CodemodeProcessor;
pub use agentstream::config::{DebounceConfig, LanguageModelConfig, RuntimeConfig};
pub use agentstream::error::StreamError;
pub use agentstream::event::{types, Event, EventInput, StreamPath, TraceContext};
pub use agentstream::language_model::{
    HistoryMessage, HistoryRole, LanguageModel, ResponsePart, ResponsePartStream, TokenUsage,
};
pub use agentstream::llm_loop::LlmLoopProcessor;
pub use agentstream::manager::StreamManager;
pub use agentstream::offset::Offset;
pub use agentstream::processor::Processor;
pub use agentstream::stream::{EventStream, EventSubscription};

// Convenience re-exports for module paths used in doc examples and tests.
pub use agentstream::language_model;
pub use agentstream::matcher;
pub use agentstream::storage;
pub use agentstream::testing;

/// Initialize env_logger once for examples and tests; repeated calls are
/// no-ops.
pub fn init_logger() {
    let _ = env_logger::builder().format_timestamp_millis().try_init();
}
