//! The LLM loop: drives language-model generation from conversation
//! history recorded in the log.
//!
//! State is a pure fold of the log prefix. `user-message` and
//! `developer-message` events extend the history and mark the offset a
//! response is still required from; the processor's own `response:sse`
//! text deltas rebuild assistant messages; `request-started` records the
//! offset of the most recent generation this processor opened.
//!
//! A generation is triggered iff the processor is enabled and
//! `request_required_from > last_responded_at` (absent values compare as
//! minus infinity). Because `request-started` always receives a higher
//! offset than the message that caused it, the comparison flips as soon as
//! the start event is folded and no further trigger fires until the next
//! user or developer message. `last_responded_at` is never cleared, on
//! success or failure.
//!
//! Triggers pass through a [`Debouncer`] (defaults 200 ms quiet, 2 s max
//! wait) holding the latest history snapshot. Each fired request follows
//! the per-request protocol: append `request-started`, take the
//! [`ActiveRequest`] slot (interrupting and recording the previous
//! occupant), stream parts as `response:sse` events, and close with
//! `request-ended` or `request-cancelled`.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::agentstream::active_request::{ActiveRequest, InterruptHandle};
use crate::agentstream::config::DebounceConfig;
use crate::agentstream::debounce::Debouncer;
use crate::agentstream::error::StreamError;
use crate::agentstream::event::{types, Event, EventInput, TraceContext};
use crate::agentstream::language_model::{HistoryMessage, HistoryRole, LanguageModel};
use crate::agentstream::offset::Offset;
use crate::agentstream::processor::{hydrate, Processor};
use crate::agentstream::stream::EventStream;

use async_trait::async_trait;
use futures_util::StreamExt;

pub struct LlmLoopProcessor {
    model: Arc<dyn LanguageModel>,
    debounce: DebounceConfig,
}

#[derive(Default)]
struct LlmLoopState {
    last_offset: Option<Offset>,
    enabled: bool,
    system_prompt: String,
    history: Vec<HistoryMessage>,
    // History index of the assistant message per request offset, so text
    // deltas append to the right entry.
    assistant_entries: HashMap<u64, usize>,
    request_required_from: Option<Offset>,
    last_responded_at: Option<Offset>,
    // Trace of the most recent trigger, propagated into the request chain.
    trigger_trace: Option<TraceContext>,
}

impl LlmLoopState {
    fn push_history(&mut self, role: HistoryRole, content: String, event: &Event) {
        self.history.push(HistoryMessage::new(role, content));
        self.request_required_from = Some(event.offset);
        self.trigger_trace = event.trace.clone();
    }

    fn should_trigger(&self) -> bool {
        let required = match self.request_required_from {
            Some(offset) => offset,
            None => return false,
        };
        self.enabled
            && match self.last_responded_at {
                Some(responded) => required > responded,
                None => true,
            }
    }

    /// The prompt for the next generation: the accumulated system prompt
    /// (as a developer message) followed by the conversation history.
    fn prompt(&self) -> Vec<HistoryMessage> {
        let mut prompt = Vec::with_capacity(self.history.len() + 1);
        if !self.system_prompt.is_empty() {
            prompt.push(HistoryMessage::new(
                HistoryRole::Developer,
                self.system_prompt.clone(),
            ));
        }
        prompt.extend(self.history.iter().cloned());
        prompt
    }
}

impl LlmLoopProcessor {
    pub fn new(model: Arc<dyn LanguageModel>, debounce: DebounceConfig) -> Self {
        LlmLoopProcessor { model, debounce }
    }

    fn reduce(&self, state: &mut LlmLoopState, event: &Event) {
        match event.event_type.as_str() {
            types::USER_MESSAGE => {
                let content = event.payload_str("content").unwrap_or_default().to_string();
                state.push_history(HistoryRole::User, content, event);
            }
            types::USER_AUDIO => {
                // Transcription is not a core concern; the audio still
                // demands a response.
                state.push_history(HistoryRole::User, "[audio message]".to_string(), event);
            }
            types::DEVELOPER_MESSAGE => {
                let content = event.payload_str("content").unwrap_or_default().to_string();
                state.push_history(HistoryRole::Developer, content, event);
            }
            types::CONFIG_SET => {
                state.enabled = event.payload_str("model") == Some(self.model.model_name());
            }
            types::SYSTEM_PROMPT_EDIT => {
                if event.payload_str("mode") == Some("append") {
                    let content = event.payload_str("content").unwrap_or_default();
                    if !state.system_prompt.is_empty() {
                        state.system_prompt.push_str("\n\n");
                    }
                    state.system_prompt.push_str(content);
                }
            }
            types::REQUEST_STARTED => {
                state.last_responded_at = Some(event.offset);
            }
            types::RESPONSE_SSE => {
                let request_offset = match event.payload_offset("requestOffset") {
                    Some(offset) => offset.value(),
                    None => return,
                };
                let part = &event.payload["part"];
                if part["type"] == "text-delta" {
                    let delta = part["delta"].as_str().unwrap_or_default();
                    let index = match state.assistant_entries.get(&request_offset) {
                        Some(&index) => index,
                        None => {
                            state
                                .history
                                .push(HistoryMessage::new(HistoryRole::Assistant, ""));
                            let index = state.history.len() - 1;
                            state.assistant_entries.insert(request_offset, index);
                            index
                        }
                    };
                    state.history[index].content.push_str(delta);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Processor for LlmLoopProcessor {
    fn name(&self) -> &'static str {
        "llm-loop"
    }

    async fn run(&self, stream: Arc<EventStream>) -> Result<(), StreamError> {
        let mut state = LlmLoopState::default();
        state.last_offset = hydrate(&stream, &mut state, |s, e| self.reduce(s, e)).await?;

        let active = Arc::new(ActiveRequest::new());
        let debouncer = {
            let stream = stream.clone();
            let model = self.model.clone();
            let active = active.clone();
            Debouncer::new(
                self.debounce.quiet,
                self.debounce.max_wait,
                move |(prompt, trace): (Vec<HistoryMessage>, Option<TraceContext>)| {
                    start_request(
                        stream.clone(),
                        model.clone(),
                        active.clone(),
                        prompt,
                        trace,
                    )
                },
            )
        };

        // A message that arrived while the processor was down still needs a
        // response; replay closed the guard only if a request-started was
        // recorded after it.
        if state.should_trigger() {
            debouncer
                .call((state.prompt(), state.trigger_trace.clone()))
                .await;
        }

        let mut subscription = stream.subscribe(state.last_offset).await?;
        while let Some(item) = subscription.next().await {
            let event = item?;
            self.reduce(&mut state, &event);
            state.last_offset = Some(event.offset);
            if state.should_trigger() {
                debouncer
                    .call((state.prompt(), state.trigger_trace.clone()))
                    .await;
            }
        }
        Ok(())
    }
}

struct GenerationFailure {
    interrupted: bool,
    message: String,
}

/// Debounced entry point for one generation. Event recording failures are
/// logged; the supervised reduce loop is unaffected.
async fn start_request(
    stream: Arc<EventStream>,
    model: Arc<dyn LanguageModel>,
    active: Arc<ActiveRequest>,
    prompt: Vec<HistoryMessage>,
    trace: Option<TraceContext>,
) {
    if let Err(e) = run_request(&stream, &model, &active, prompt, trace).await {
        log::error!(
            "llm-loop could not record generation events on '{}': {}",
            stream.path(),
            e
        );
    }
}

async fn run_request(
    stream: &EventStream,
    model: &Arc<dyn LanguageModel>,
    active: &ActiveRequest,
    prompt: Vec<HistoryMessage>,
    trace: Option<TraceContext>,
) -> Result<(), StreamError> {
    let mut input = EventInput::new(
        types::REQUEST_STARTED,
        json!({ "model": model.model_name() }),
    );
    if let Some(trace) = &trace {
        input = input.with_trace(trace.child());
    }
    let started = stream.append(input).await?;
    let request_offset = started.offset;

    let handle = InterruptHandle::new();
    if let Some(previous) = active.replace(request_offset, handle.clone()) {
        stream
            .append(started.reaction(
                types::REQUEST_INTERRUPTED,
                json!({ "requestOffset": previous.to_string() }),
            ))
            .await?;
    }

    let outcome = drive_generation(stream, model, &prompt, request_offset, &started, &handle).await;
    let result = match outcome {
        Ok(()) => {
            stream
                .append(started.reaction(
                    types::REQUEST_ENDED,
                    json!({ "requestOffset": request_offset.to_string() }),
                ))
                .await
        }
        Err(failure) => {
            let reason = if failure.interrupted {
                "interrupted"
            } else {
                "error"
            };
            stream
                .append(started.reaction(
                    types::REQUEST_CANCELLED,
                    json!({
                        "requestOffset": request_offset.to_string(),
                        "reason": reason,
                        "message": failure.message,
                    }),
                ))
                .await
        }
    };
    // Release the slot only if a newer request has not already taken it.
    active.clear_if(request_offset);
    result.map(|_| ())
}

async fn drive_generation(
    stream: &EventStream,
    model: &Arc<dyn LanguageModel>,
    prompt: &[HistoryMessage],
    request_offset: Offset,
    started: &Event,
    handle: &InterruptHandle,
) -> Result<(), GenerationFailure> {
    let mut parts = model
        .stream_generation(prompt)
        .await
        .map_err(|e| GenerationFailure {
            interrupted: handle.is_interrupted(),
            message: e.to_string(),
        })?;

    loop {
        tokio::select! {
            biased;
            _ = handle.wait() => {
                return Err(GenerationFailure {
                    interrupted: true,
                    message: "interrupted by a newer request".to_string(),
                });
            }
            part = parts.next() => match part {
                None => return Ok(()),
                Some(Ok(part)) => {
                    stream
                        .append(started.reaction(
                            types::RESPONSE_SSE,
                            json!({
                                "part": part,
                                "requestOffset": request_offset.to_string(),
                            }),
                        ))
                        .await
                        .map_err(|e| GenerationFailure {
                            interrupted: false,
                            message: e.to_string(),
                        })?;
                }
                Some(Err(e)) => {
                    return Err(GenerationFailure {
                        interrupted: handle.is_interrupted(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(offset: u64, event_type: &str, payload: serde_json::Value) -> Event {
        Event {
            path: "p".into(),
            offset: Offset::new(offset),
            event_type: event_type.into(),
            payload,
            version: None,
            created_at: Utc::now(),
            trace: None,
        }
    }

    fn processor() -> LlmLoopProcessor {
        LlmLoopProcessor::new(
            Arc::new(crate::agentstream::language_model::EchoModel::default()),
            DebounceConfig::default(),
        )
    }

    #[test]
    fn test_trigger_requires_enabled_and_newer_message() {
        let p = processor();
        let mut state = LlmLoopState::default();

        p.reduce(
            &mut state,
            &event(0, types::USER_MESSAGE, json!({"content": "hi"})),
        );
        // Not enabled yet.
        assert!(!state.should_trigger());

        p.reduce(&mut state, &event(1, types::CONFIG_SET, json!({"model": "echo"})));
        assert!(state.should_trigger());

        // The recorded request-started overtakes the message offset.
        p.reduce(&mut state, &event(2, types::REQUEST_STARTED, json!({})));
        assert!(!state.should_trigger());

        // A newer message re-opens the guard.
        p.reduce(
            &mut state,
            &event(3, types::USER_MESSAGE, json!({"content": "more"})),
        );
        assert!(state.should_trigger());
    }

    #[test]
    fn test_config_for_other_model_disables() {
        let p = processor();
        let mut state = LlmLoopState::default();
        p.reduce(&mut state, &event(0, types::CONFIG_SET, json!({"model": "echo"})));
        assert!(state.enabled);
        p.reduce(
            &mut state,
            &event(1, types::CONFIG_SET, json!({"model": "other"})),
        );
        assert!(!state.enabled);
    }

    #[test]
    fn test_history_folds_deltas_per_request() {
        let p = processor();
        let mut state = LlmLoopState::default();
        p.reduce(
            &mut state,
            &event(0, types::USER_MESSAGE, json!({"content": "hi"})),
        );
        for (offset, delta) in [(2u64, "hel"), (3, "lo")] {
            p.reduce(
                &mut state,
                &event(
                    offset,
                    types::RESPONSE_SSE,
                    json!({
                        "part": {"type": "text-delta", "id": "t", "delta": delta},
                        "requestOffset": Offset::new(1).to_string(),
                    }),
                ),
            );
        }
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[1].content, "hello");
    }

    #[test]
    fn test_system_prompt_edits_accumulate() {
        let p = processor();
        let mut state = LlmLoopState::default();
        p.reduce(
            &mut state,
            &event(
                0,
                types::SYSTEM_PROMPT_EDIT,
                json!({"mode": "append", "content": "base", "source": "codemode"}),
            ),
        );
        p.reduce(
            &mut state,
            &event(
                1,
                types::SYSTEM_PROMPT_EDIT,
                json!({"mode": "append", "content": "tool", "source": "codemode:tool:x"}),
            ),
        );
        assert_eq!(state.system_prompt, "base\n\ntool");
        let prompt = state.prompt();
        assert_eq!(prompt[0].role, HistoryRole::Developer);
    }
}
