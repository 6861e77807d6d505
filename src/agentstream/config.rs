//! Runtime configuration.
//!
//! Users construct [`RuntimeConfig`] manually; no config-file parsing
//! dependencies are introduced. The daemon binary reads overrides from
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Debounce windows for the LLM loop's trigger.
#[derive(Debug, Clone, Copy)]
pub struct DebounceConfig {
    /// Quiet period with no new trigger before a burst fires.
    pub quiet: Duration,
    /// Ceiling from the first trigger of a burst after which it fires
    /// unconditionally.
    pub max_wait: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        DebounceConfig {
            quiet: Duration::from_millis(200),
            max_wait: Duration::from_secs(2),
        }
    }
}

/// Opaque language-model selection, resolved by the adapter layer.
#[derive(Debug, Clone)]
pub struct LanguageModelConfig {
    pub provider: String,
    pub model: String,
    pub credentials: Option<String>,
}

/// Top-level runtime options.
pub struct RuntimeConfig {
    /// HTTP listen port for the transport.
    pub port: u16,
    /// Persistence root for the file storage.
    pub data_dir: PathBuf,
    /// Debounce windows for LLM triggers.
    pub llm_debounce: DebounceConfig,
    /// Cadence of `clock:time-tick` events while deferred blocks exist.
    pub clock_interval_seconds: u64,
    /// Language model selection; `None` leaves the daemon on the built-in
    /// echo adapter.
    pub language_model: Option<LanguageModelConfig>,
    /// Subscriber queue depth for each path's live fan-out.
    pub hub_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            port: 3000,
            data_dir: PathBuf::from(".data/streams"),
            llm_debounce: DebounceConfig::default(),
            clock_interval_seconds: 1,
            language_model: None,
            hub_capacity: 1024,
        }
    }
}
