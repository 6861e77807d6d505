//! Provider-agnostic language-model adapter.
//!
//! The runtime drives generation exclusively through the [`LanguageModel`]
//! trait; concrete vendor protocols live outside the core. An adapter
//! translates a conversation history into a stream of [`ResponsePart`]s
//! that the LLM loop records as `llm-loop:response:sse` events.
//!
//! The crate ships [`EchoModel`], a dependency-free adapter that streams
//! the last user message back word by word. It backs the daemon's default
//! configuration and keeps demos and tests free of network access.

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::pin::Pin;

/// Who authored a history element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
    Developer,
}

/// One element of the conversation history handed to the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: HistoryRole,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: HistoryRole, content: impl Into<String>) -> Self {
        HistoryMessage {
            role,
            content: content.into(),
        }
    }
}

/// Token accounting reported by the provider at the end of a generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// One part of a streaming generation, in wire order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResponsePart {
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    TextEnd { id: String },
    ResponseMetadata { model: String },
    Finish { usage: TokenUsage },
}

/// The stream an adapter yields for one generation.
pub type ResponsePartStream =
    Pin<Box<dyn Stream<Item = Result<ResponsePart, Box<dyn Error + Send + Sync>>> + Send>>;

/// Trait-driven boundary to a concrete language-model provider.
///
/// Implementations must be thread-safe so one adapter instance can serve
/// every path. Cancellation is driven by the caller dropping the part
/// stream; adapters must not require explicit teardown.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Open a streaming generation for `prompt`. Errors returned here (or
    /// mid-stream) are recorded as `request-cancelled` events by the LLM
    /// loop; they never restart the processor.
    async fn stream_generation(
        &self,
        prompt: &[HistoryMessage],
    ) -> Result<ResponsePartStream, Box<dyn Error + Send + Sync>>;

    /// Identifier used to select this adapter via `agent:config:set`.
    fn model_name(&self) -> &str;
}

/// Offline adapter that echoes the last user message back word by word.
pub struct EchoModel {
    model: String,
}

impl EchoModel {
    pub fn new(model: impl Into<String>) -> Self {
        EchoModel {
            model: model.into(),
        }
    }
}

impl Default for EchoModel {
    fn default() -> Self {
        EchoModel::new("echo")
    }
}

#[async_trait]
impl LanguageModel for EchoModel {
    async fn stream_generation(
        &self,
        prompt: &[HistoryMessage],
    ) -> Result<ResponsePartStream, Box<dyn Error + Send + Sync>> {
        let last_user = prompt
            .iter()
            .rev()
            .find(|m| m.role == HistoryRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let id = uuid::Uuid::new_v4().simple().to_string();
        let model = self.model.clone();

        let mut parts = vec![
            ResponsePart::ResponseMetadata { model },
            ResponsePart::TextStart { id: id.clone() },
        ];
        let mut output_tokens = 0;
        for word in last_user.split_inclusive(' ') {
            output_tokens += 1;
            parts.push(ResponsePart::TextDelta {
                id: id.clone(),
                delta: word.to_string(),
            });
        }
        parts.push(ResponsePart::TextEnd { id });
        let input_tokens: usize = prompt.iter().map(|m| m.content.len() / 4).sum();
        parts.push(ResponsePart::Finish {
            usage: TokenUsage {
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
            },
        });

        Ok(Box::pin(futures_util::stream::iter(
            parts.into_iter().map(Ok),
        )))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_echo_model_streams_last_user_message() {
        let model = EchoModel::default();
        let prompt = vec![
            HistoryMessage::new(HistoryRole::User, "ignored"),
            HistoryMessage::new(HistoryRole::User, "hello world"),
        ];
        let mut stream = model.stream_generation(&prompt).await.unwrap();

        let mut text = String::new();
        let mut finished = false;
        while let Some(part) = stream.next().await {
            match part.unwrap() {
                ResponsePart::TextDelta { delta, .. } => text.push_str(&delta),
                ResponsePart::Finish { .. } => finished = true,
                _ => {}
            }
        }
        assert_eq!(text, "hello world");
        assert!(finished);
    }

    #[test]
    fn test_response_part_wire_format() {
        let part = ResponsePart::TextDelta {
            id: "t1".into(),
            delta: "hi".into(),
        };
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "text-delta");
        assert_eq!(value["delta"], "hi");
    }
}
