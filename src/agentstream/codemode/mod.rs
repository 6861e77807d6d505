//! The codemode processor: executes `<codemode>` blocks from assistant
//! output in per-call sandboxes, surfaces results as developer messages,
//! and polls deferred blocks on clock ticks.
//!
//! Assistant text is rebuilt by folding `response:sse` text deltas per
//! request offset. On `request-ended` the processor extracts blocks and
//! appends one `code-block-added` per block not yet counted in the
//! request's processed-block count; the count itself is folded from
//! `code-block-added` events, so a restart never re-emits blocks that are
//! already in the log. Each `code-block-added` without a folded
//! `code-eval-started` starts an evaluation on its own task, keeping the
//! reduce loop responsive while code runs.
//!
//! Tool registration and the one-shot system-prompt addenda follow the
//! replay-skip pattern: the set of already published prompt sources is
//! folded from prior `system-prompt-edit` events, and the hydrate fold runs
//! to completion before the live phase reacts, so replay observes the
//! recorded prompt and does not publish again.

pub mod blocks;
pub mod deferred;
pub mod prompt;
pub mod sandbox;

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::agentstream::error::StreamError;
use crate::agentstream::event::{types, Event};
use crate::agentstream::offset::Offset;
use crate::agentstream::processor::{hydrate, Processor};
use crate::agentstream::stream::EventStream;

use self::blocks::{extract_blocks, parse_request_id, request_id};
use self::deferred::{is_truthy, DeferredBlock};
use self::sandbox::{Capabilities, CodeEvaluator, RegisteredTool, Sandbox};

pub struct CodemodeProcessor {
    evaluator: Arc<dyn CodeEvaluator>,
    capabilities: Arc<Capabilities>,
}

#[derive(Default)]
struct RequestBuffer {
    text: String,
    processed_blocks: usize,
}

#[derive(Default)]
struct CodemodeState {
    last_offset: Option<Offset>,
    base_prompt_emitted: bool,
    tool_prompts_emitted: HashSet<String>,
    tools: BTreeMap<String, RegisteredTool>,
    // Assistant text and processed-block count per request offset.
    requests: HashMap<u64, RequestBuffer>,
    evals_started: HashSet<String>,
    deferred: BTreeMap<Offset, DeferredBlock>,
    elapsed_seconds: u64,
}

impl CodemodeProcessor {
    pub fn new(evaluator: Arc<dyn CodeEvaluator>, capabilities: Arc<Capabilities>) -> Self {
        CodemodeProcessor {
            evaluator,
            capabilities,
        }
    }

    fn reduce(state: &mut CodemodeState, event: &Event) {
        match event.event_type.as_str() {
            types::RESPONSE_SSE => {
                let request_offset = match event.payload_offset("requestOffset") {
                    Some(offset) => offset.value(),
                    None => return,
                };
                let part = &event.payload["part"];
                if part["type"] == "text-delta" {
                    state
                        .requests
                        .entry(request_offset)
                        .or_default()
                        .text
                        .push_str(part["delta"].as_str().unwrap_or_default());
                }
            }
            types::CODE_BLOCK_ADDED => {
                if let Some((request_offset, index)) =
                    event.payload_str("requestId").and_then(parse_request_id)
                {
                    let buffer = state.requests.entry(request_offset.value()).or_default();
                    buffer.processed_blocks = buffer.processed_blocks.max(index + 1);
                }
            }
            types::CODE_EVAL_STARTED => {
                if let Some(id) = event.payload_str("requestId") {
                    state.evals_started.insert(id.to_string());
                }
            }
            types::TOOL_REGISTERED => {
                if let Ok(tool) =
                    serde_json::from_value::<RegisteredTool>(event.payload.clone())
                {
                    state.tools.insert(tool.name.clone(), tool);
                }
            }
            types::TOOL_UNREGISTERED => {
                if let Some(name) = event.payload_str("name") {
                    state.tools.remove(name);
                }
            }
            types::SYSTEM_PROMPT_EDIT => match event.payload_str("source") {
                Some(prompt::BASE_PROMPT_SOURCE) => state.base_prompt_emitted = true,
                Some(source) => {
                    if let Some(name) = prompt::tool_name_from_source(source) {
                        state.tool_prompts_emitted.insert(name.to_string());
                    }
                }
                None => {}
            },
            types::DEFERRED_BLOCK_ADDED => {
                if let Some(block) = DeferredBlock::from_event(event, state.elapsed_seconds) {
                    state.deferred.insert(event.offset, block);
                }
            }
            types::DEFERRED_POLL_ATTEMPTED => {
                if let Some(offset) = event.payload_offset("blockOffset") {
                    if let Some(block) = state.deferred.get_mut(&offset) {
                        block.attempt_count =
                            event.payload["attemptNumber"].as_u64().unwrap_or(0) as u32;
                        block.last_poll_elapsed_seconds = event.payload["elapsedSeconds"]
                            .as_u64()
                            .unwrap_or(block.last_poll_elapsed_seconds);
                    }
                }
            }
            types::DEFERRED_COMPLETED
            | types::DEFERRED_FAILED
            | types::DEFERRED_TIMED_OUT
            | types::DEFERRED_CANCELLED => {
                if let Some(offset) = event.payload_offset("blockOffset") {
                    state.deferred.remove(&offset);
                }
            }
            types::TIME_TICK => {
                state.elapsed_seconds = event.payload["elapsedSeconds"]
                    .as_u64()
                    .unwrap_or(state.elapsed_seconds);
            }
            _ => {}
        }
    }

    async fn react(
        &self,
        stream: &Arc<EventStream>,
        state: &mut CodemodeState,
        dispatched: &mut HashMap<u64, u64>,
        event: &Event,
    ) -> Result<(), StreamError> {
        // The base addendum goes out on the first event of any kind for the
        // path, unless a prior one is already folded into state.
        if !state.base_prompt_emitted {
            stream
                .append(event.reaction(
                    types::SYSTEM_PROMPT_EDIT,
                    json!({
                        "mode": "append",
                        "content": prompt::base_prompt(),
                        "source": prompt::BASE_PROMPT_SOURCE,
                    }),
                ))
                .await?;
            state.base_prompt_emitted = true;
        }

        match event.event_type.as_str() {
            types::TOOL_REGISTERED => {
                let name = event.payload_str("name").unwrap_or_default().to_string();
                if !name.is_empty() && !state.tool_prompts_emitted.contains(&name) {
                    if let Some(tool) = state.tools.get(&name) {
                        stream
                            .append(event.reaction(
                                types::SYSTEM_PROMPT_EDIT,
                                json!({
                                    "mode": "append",
                                    "content": prompt::tool_prompt(tool),
                                    "source": prompt::tool_prompt_source(&name),
                                }),
                            ))
                            .await?;
                    }
                    state.tool_prompts_emitted.insert(name);
                }
            }
            types::REQUEST_ENDED => {
                let request_offset = match event.payload_offset("requestOffset") {
                    Some(offset) => offset,
                    None => return Ok(()),
                };
                let buffer = state.requests.entry(request_offset.value()).or_default();
                let blocks = extract_blocks(&buffer.text);
                for index in buffer.processed_blocks..blocks.len() {
                    stream
                        .append(event.reaction(
                            types::CODE_BLOCK_ADDED,
                            json!({
                                "requestId": request_id(request_offset, index),
                                "code": blocks[index],
                            }),
                        ))
                        .await?;
                }
                buffer.processed_blocks = buffer.processed_blocks.max(blocks.len());
            }
            types::CODE_BLOCK_ADDED => {
                let id = event.payload_str("requestId").unwrap_or_default().to_string();
                if !id.is_empty() && !state.evals_started.contains(&id) {
                    state.evals_started.insert(id.clone());
                    let code = event.payload_str("code").unwrap_or_default().to_string();
                    tokio::spawn(evaluate_block_task(
                        stream.clone(),
                        self.evaluator.clone(),
                        self.capabilities.clone(),
                        state.tools.clone(),
                        id,
                        code,
                        event.clone(),
                    ));
                }
            }
            types::TIME_TICK => {
                let elapsed = state.elapsed_seconds;
                let mut due = Vec::new();
                for block in state.deferred.values() {
                    if !block.due(elapsed) {
                        continue;
                    }
                    // A dispatch within the block's interval is still in
                    // flight or its poll events are still in the backlog;
                    // skip until the fold catches up.
                    let key = block.block_offset.value();
                    if dispatched
                        .get(&key)
                        .is_some_and(|&at| elapsed < at + block.check_interval_seconds)
                    {
                        continue;
                    }
                    dispatched.insert(key, elapsed);
                    due.push(DuePoll {
                        block: block.clone(),
                        attempt_number: block.attempt_count + 1,
                    });
                }
                if !due.is_empty() {
                    tokio::spawn(poll_deferred_task(
                        stream.clone(),
                        self.evaluator.clone(),
                        self.capabilities.clone(),
                        state.tools.clone(),
                        due,
                        elapsed,
                        event.clone(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for CodemodeProcessor {
    fn name(&self) -> &'static str {
        "codemode"
    }

    async fn run(&self, stream: Arc<EventStream>) -> Result<(), StreamError> {
        let mut state = CodemodeState::default();
        state.last_offset = hydrate(&stream, &mut state, Self::reduce).await?;

        // Runtime-only dispatch guard per block offset; replay rebuilds
        // poll progress from the folded events instead.
        let mut dispatched: HashMap<u64, u64> = HashMap::new();

        let mut subscription = stream.subscribe(state.last_offset).await?;
        while let Some(item) = subscription.next().await {
            let event = item?;
            Self::reduce(&mut state, &event);
            state.last_offset = Some(event.offset);
            self.react(&stream, &mut state, &mut dispatched, &event)
                .await?;
        }
        Ok(())
    }
}

struct DuePoll {
    block: DeferredBlock,
    attempt_number: u32,
}

fn serialize_result(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[non-serializable result]".to_string())
}

/// Append the events buffered via `emit()` during one evaluation, in
/// order, stamping the evaluation's trace on entries that carry none.
async fn append_emitted(
    stream: &EventStream,
    sandbox: &Sandbox,
    origin: &Event,
) -> Result<(), StreamError> {
    for mut emitted in sandbox.take_emitted() {
        if emitted.trace.is_none() {
            emitted = match &origin.trace {
                Some(trace) => emitted.with_trace(trace.child()),
                None => emitted,
            };
        }
        stream.append(emitted).await?;
    }
    Ok(())
}

async fn evaluate_block_task(
    stream: Arc<EventStream>,
    evaluator: Arc<dyn CodeEvaluator>,
    capabilities: Arc<Capabilities>,
    tools: BTreeMap<String, RegisteredTool>,
    request_id: String,
    code: String,
    origin: Event,
) {
    if let Err(e) = run_block(
        &stream,
        evaluator,
        capabilities,
        tools,
        &request_id,
        &code,
        &origin,
    )
    .await
    {
        log::error!(
            "codemode could not record evaluation events for block {} on '{}': {}",
            request_id,
            stream.path(),
            e
        );
    }
}

async fn run_block(
    stream: &Arc<EventStream>,
    evaluator: Arc<dyn CodeEvaluator>,
    capabilities: Arc<Capabilities>,
    tools: BTreeMap<String, RegisteredTool>,
    request_id: &str,
    code: &str,
    origin: &Event,
) -> Result<(), StreamError> {
    let started = stream
        .append(origin.reaction(types::CODE_EVAL_STARTED, json!({ "requestId": request_id })))
        .await?;

    let sandbox = Sandbox::new(capabilities, tools, evaluator.clone());
    let result = evaluator.evaluate_block(code, &sandbox).await;

    append_emitted(stream, &sandbox, &started).await?;
    let logs = serde_json::to_value(sandbox.take_console())?;

    match result {
        Ok(value) => {
            let data = serialize_result(&value);
            stream
                .append(started.reaction(
                    types::CODE_EVAL_DONE,
                    json!({ "requestId": request_id, "data": data, "logs": logs }),
                ))
                .await?;
            stream
                .append(started.reaction(
                    types::DEVELOPER_MESSAGE,
                    json!({
                        "content": format!(
                            "Codemode block {} finished. Result: {}",
                            request_id, data
                        ),
                    }),
                ))
                .await?;
        }
        Err(message) => {
            stream
                .append(started.reaction(
                    types::CODE_EVAL_FAILED,
                    json!({ "requestId": request_id, "error": message, "logs": logs }),
                ))
                .await?;
            stream
                .append(started.reaction(
                    types::DEVELOPER_MESSAGE,
                    json!({
                        "content": format!(
                            "Codemode block {} failed: {}",
                            request_id, message
                        ),
                    }),
                ))
                .await?;
        }
    }
    Ok(())
}

async fn poll_deferred_task(
    stream: Arc<EventStream>,
    evaluator: Arc<dyn CodeEvaluator>,
    capabilities: Arc<Capabilities>,
    tools: BTreeMap<String, RegisteredTool>,
    due: Vec<DuePoll>,
    elapsed_seconds: u64,
    origin: Event,
) {
    // Deterministic order: due was collected in block offset order.
    for poll in due {
        let block_offset = poll.block.block_offset;
        if let Err(e) = run_poll(
            &stream,
            &evaluator,
            &capabilities,
            &tools,
            &poll,
            elapsed_seconds,
            &origin,
        )
        .await
        {
            log::error!(
                "codemode could not record poll events for deferred block {} on '{}': {}",
                block_offset,
                stream.path(),
                e
            );
        }
    }
}

async fn run_poll(
    stream: &Arc<EventStream>,
    evaluator: &Arc<dyn CodeEvaluator>,
    capabilities: &Arc<Capabilities>,
    tools: &BTreeMap<String, RegisteredTool>,
    poll: &DuePoll,
    elapsed_seconds: u64,
    origin: &Event,
) -> Result<(), StreamError> {
    let block = &poll.block;
    let block_offset = block.block_offset.to_string();

    let sandbox = Sandbox::new(capabilities.clone(), tools.clone(), evaluator.clone());
    let outcome = evaluator.evaluate_block(&block.code, &sandbox).await;

    append_emitted(stream, &sandbox, origin).await?;
    let logs = serde_json::to_value(sandbox.take_console())?;

    let poll_attempted = |result: serde_json::Value| {
        origin.reaction(
            types::DEFERRED_POLL_ATTEMPTED,
            json!({
                "blockOffset": block_offset.clone(),
                "attemptNumber": poll.attempt_number,
                "elapsedSeconds": elapsed_seconds,
                "result": result,
                "logs": logs.clone(),
            }),
        )
    };

    match outcome {
        Err(message) => {
            stream.append(poll_attempted(json!(null))).await?;
            stream
                .append(origin.reaction(
                    types::DEFERRED_FAILED,
                    json!({ "blockOffset": block_offset.clone(), "error": message }),
                ))
                .await?;
            stream
                .append(origin.reaction(
                    types::DEVELOPER_MESSAGE,
                    json!({
                        "content": format!(
                            "Deferred task \"{}\" failed on attempt {}: {}",
                            block.description, poll.attempt_number, message
                        ),
                    }),
                ))
                .await?;
        }
        Ok(value) => {
            let serialized = serialize_result(&value);
            let parsed: serde_json::Value = serde_json::from_str(&serialized)
                .unwrap_or_else(|_| serde_json::Value::String(serialized.clone()));
            if is_truthy(&parsed) {
                stream
                    .append(poll_attempted(json!(serialized.clone())))
                    .await?;
                stream
                    .append(origin.reaction(
                        types::DEFERRED_COMPLETED,
                        json!({
                            "blockOffset": block_offset.clone(),
                            "result": serialized.clone(),
                        }),
                    ))
                    .await?;
                stream
                    .append(origin.reaction(
                        types::DEVELOPER_MESSAGE,
                        json!({
                            "content": format!(
                                "Deferred task \"{}\" completed on attempt {}. Result: {}",
                                block.description, poll.attempt_number, serialized
                            ),
                        }),
                    ))
                    .await?;
            } else if poll.attempt_number >= block.max_attempts {
                stream.append(poll_attempted(json!(null))).await?;
                stream
                    .append(origin.reaction(
                        types::DEFERRED_TIMED_OUT,
                        json!({
                            "blockOffset": block_offset.clone(),
                            "attempts": poll.attempt_number,
                        }),
                    ))
                    .await?;
                stream
                    .append(origin.reaction(
                        types::DEVELOPER_MESSAGE,
                        json!({
                            "content": format!(
                                "Deferred task \"{}\" gave up after {} attempts without a result.",
                                block.description, poll.attempt_number
                            ),
                        }),
                    ))
                    .await?;
            } else {
                stream.append(poll_attempted(json!(null))).await?;
                stream
                    .append(origin.reaction(
                        types::DEVELOPER_MESSAGE,
                        json!({
                            "content": format!(
                                "Deferred task \"{}\" is still pending after attempt {} of {}. \
                                 It will be polled again automatically; do not issue another \
                                 codemode block for it.",
                                block.description, poll.attempt_number, block.max_attempts
                            ),
                        }),
                    ))
                    .await?;
            }
        }
    }
    Ok(())
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

    fn delta(offset: u64, request_offset: u64, text: &str) -> Event {
        event(
            offset,
            types::RESPONSE_SSE,
            json!({
                "part": {"type": "text-delta", "id": "t", "delta": text},
                "requestOffset": Offset::new(request_offset).to_string(),
            }),
        )
    }

    #[test]
    fn test_reduce_accumulates_assistant_text_per_request() {
        let mut state = CodemodeState::default();
        CodemodeProcessor::reduce(&mut state, &delta(2, 1, "<codemode>a"));
        CodemodeProcessor::reduce(&mut state, &delta(3, 1, "</codemode>"));
        CodemodeProcessor::reduce(&mut state, &delta(4, 9, "other request"));
        assert_eq!(state.requests[&1].text, "<codemode>a</codemode>");
        assert_eq!(state.requests[&9].text, "other request");
    }

    #[test]
    fn test_reduce_counts_processed_blocks_from_log() {
        let mut state = CodemodeState::default();
        CodemodeProcessor::reduce(
            &mut state,
            &event(
                5,
                types::CODE_BLOCK_ADDED,
                json!({"requestId": "0000000000000001.1", "code": "x"}),
            ),
        );
        // Index 1 recorded means blocks 0 and 1 are both processed.
        assert_eq!(state.requests[&1].processed_blocks, 2);
    }

    #[test]
    fn test_reduce_tool_registration_lifecycle() {
        let mut state = CodemodeState::default();
        CodemodeProcessor::reduce(
            &mut state,
            &event(
                0,
                types::TOOL_REGISTERED,
                json!({
                    "name": "fetchWeather",
                    "description": "weather",
                    "parametersJsonSchema": {"type": "object"},
                    "implementation": "return null",
                }),
            ),
        );
        assert!(state.tools.contains_key("fetchWeather"));

        CodemodeProcessor::reduce(
            &mut state,
            &event(
                1,
                types::SYSTEM_PROMPT_EDIT,
                json!({
                    "mode": "append",
                    "content": "x",
                    "source": "codemode:tool:fetchWeather",
                }),
            ),
        );
        assert!(state.tool_prompts_emitted.contains("fetchWeather"));

        CodemodeProcessor::reduce(
            &mut state,
            &event(2, types::TOOL_UNREGISTERED, json!({"name": "fetchWeather"})),
        );
        assert!(!state.tools.contains_key("fetchWeather"));
        // The prompt stays published; re-registration must not re-emit.
        assert!(state.tool_prompts_emitted.contains("fetchWeather"));
    }

    #[test]
    fn test_reduce_deferred_lifecycle() {
        let mut state = CodemodeState::default();
        CodemodeProcessor::reduce(
            &mut state,
            &event(0, types::TIME_TICK, json!({"elapsedSeconds": 5})),
        );
        CodemodeProcessor::reduce(
            &mut state,
            &event(
                1,
                types::DEFERRED_BLOCK_ADDED,
                json!({
                    "code": "return null",
                    "checkIntervalSeconds": 10,
                    "maxAttempts": 3,
                    "description": "poll",
                }),
            ),
        );
        let block = &state.deferred[&Offset::new(1)];
        assert_eq!(block.last_poll_elapsed_seconds, 5);
        assert_eq!(block.max_attempts, 3);
        assert!(!block.due(14));
        assert!(block.due(15));

        CodemodeProcessor::reduce(
            &mut state,
            &event(
                2,
                types::DEFERRED_POLL_ATTEMPTED,
                json!({
                    "blockOffset": Offset::new(1).to_string(),
                    "attemptNumber": 1,
                    "elapsedSeconds": 15,
                    "result": null,
                    "logs": [],
                }),
            ),
        );
        let block = &state.deferred[&Offset::new(1)];
        assert_eq!(block.attempt_count, 1);
        assert_eq!(block.last_poll_elapsed_seconds, 15);

        CodemodeProcessor::reduce(
            &mut state,
            &event(
                3,
                types::DEFERRED_CANCELLED,
                json!({"blockOffset": Offset::new(1).to_string()}),
            ),
        );
        assert!(state.deferred.is_empty());
    }

    #[test]
    fn test_reduce_base_prompt_flag() {
        let mut state = CodemodeState::default();
        CodemodeProcessor::reduce(
            &mut state,
            &event(
                0,
                types::SYSTEM_PROMPT_EDIT,
                json!({"mode": "append", "content": "x", "source": "codemode"}),
            ),
        );
        assert!(state.base_prompt_emitted);
    }
}
