//! The agentstream daemon: file-backed event logs behind the HTTP
//! transport, with the full processor fleet registered per path.
//!
//! Configuration comes from the environment:
//!
//! - `AGENTSTREAM_PORT` (default 3000)
//! - `AGENTSTREAM_DATA_DIR` (default `.data/streams`)
//! - `AGENTSTREAM_MODEL` (default `echo`, the built-in offline adapter)
//! - `AGENTSTREAM_CLOCK_INTERVAL_SECONDS` (default 1)
//!
//! Vendor language-model adapters plug in by constructing the runtime in
//! code instead; the daemon itself stays vendor free.

use std::sync::Arc;

use agentstream::agentstream::codemode::sandbox::{CodeEvaluator, Sandbox};
use agentstream::agentstream::server;
use agentstream::language_model::EchoModel;
use agentstream::storage::FileStorage;
use agentstream::{
    Capabilities, ClockProcessor, CodemodeProcessor, LanguageModelConfig, LlmLoopProcessor,
    RuntimeConfig, StreamManager,
};

use async_trait::async_trait;

/// Placeholder evaluator for deployments without an embedded scripting
/// runtime: every block reports that evaluation is not configured.
struct UnconfiguredEvaluator;

#[async_trait]
impl CodeEvaluator for UnconfiguredEvaluator {
    async fn evaluate_block(
        &self,
        _code: &str,
        _sandbox: &Sandbox,
    ) -> Result<serde_json::Value, String> {
        Err("no code evaluator is configured for this deployment".to_string())
    }

    async fn evaluate_tool(
        &self,
        _implementation: &str,
        _params: serde_json::Value,
        _sandbox: &Sandbox,
    ) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> {
        Err("no code evaluator is configured for this deployment".into())
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = RuntimeConfig::default();
    config.port = env_or("AGENTSTREAM_PORT", config.port);
    config.clock_interval_seconds = env_or(
        "AGENTSTREAM_CLOCK_INTERVAL_SECONDS",
        config.clock_interval_seconds,
    );
    if let Ok(dir) = std::env::var("AGENTSTREAM_DATA_DIR") {
        config.data_dir = dir.into();
    }
    if let Ok(model) = std::env::var("AGENTSTREAM_MODEL") {
        config.language_model = Some(LanguageModelConfig {
            provider: std::env::var("AGENTSTREAM_PROVIDER").unwrap_or_else(|_| "echo".to_string()),
            model,
            credentials: std::env::var("AGENTSTREAM_CREDENTIALS").ok(),
        });
    }

    // The daemon only resolves the built-in offline provider; vendor
    // adapters are wired up in code by embedding the runtime instead.
    let model = match &config.language_model {
        None => Arc::new(EchoModel::default()),
        Some(selection) if selection.provider == "echo" => {
            Arc::new(EchoModel::new(selection.model.clone()))
        }
        Some(selection) => {
            return Err(format!("unknown language model provider: {}", selection.provider).into())
        }
    };

    let storage = Arc::new(FileStorage::open(&config.data_dir)?);
    let capabilities = Arc::new(Capabilities::live());
    let evaluator = Arc::new(UnconfiguredEvaluator);

    let manager = StreamManager::new(storage)
        .with_hub_capacity(config.hub_capacity)
        .with_processor(Arc::new(LlmLoopProcessor::new(model, config.llm_debounce)))
        .with_processor(Arc::new(CodemodeProcessor::new(evaluator, capabilities)))
        .with_processor(Arc::new(ClockProcessor::new(config.clock_interval_seconds)))
        .build();

    // Resume processors for paths recorded before this start.
    manager.open_existing().await?;

    server::serve(manager, &config).await
}
