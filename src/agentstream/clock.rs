//! The clock processor: emits `clock:time-tick{elapsedSeconds}` at a fixed
//! cadence while the path has outstanding deferred blocks.
//!
//! `elapsedSeconds` is monotonic per path from the first tick. The value is
//! folded from the processor's own tick events, so a restarted instance
//! resumes the count instead of restarting from zero.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::agentstream::error::StreamError;
use crate::agentstream::event::{types, Event, EventInput};
use crate::agentstream::offset::Offset;
use crate::agentstream::processor::{hydrate, Processor};
use crate::agentstream::stream::EventStream;

pub struct ClockProcessor {
    interval_seconds: u64,
}

#[derive(Default)]
struct ClockState {
    last_offset: Option<Offset>,
    outstanding: HashSet<u64>,
    elapsed_seconds: u64,
}

impl ClockProcessor {
    pub fn new(interval_seconds: u64) -> Self {
        ClockProcessor { interval_seconds }
    }

    fn reduce(state: &mut ClockState, event: &Event) {
        match event.event_type.as_str() {
            types::DEFERRED_BLOCK_ADDED => {
                state.outstanding.insert(event.offset.value());
            }
            types::DEFERRED_COMPLETED
            | types::DEFERRED_FAILED
            | types::DEFERRED_TIMED_OUT
            | types::DEFERRED_CANCELLED => {
                if let Some(offset) = event.payload_offset("blockOffset") {
                    state.outstanding.remove(&offset.value());
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
}

#[async_trait]
impl Processor for ClockProcessor {
    fn name(&self) -> &'static str {
        "clock"
    }

    async fn run(&self, stream: Arc<EventStream>) -> Result<(), StreamError> {
        let mut state = ClockState::default();
        state.last_offset = hydrate(&stream, &mut state, Self::reduce).await?;

        let period = Duration::from_secs(self.interval_seconds.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut subscription = stream.subscribe(state.last_offset).await?;
        loop {
            tokio::select! {
                item = subscription.next() => match item {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(event)) => {
                        Self::reduce(&mut state, &event);
                        state.last_offset = Some(event.offset);
                    }
                },
                _ = ticker.tick(), if !state.outstanding.is_empty() => {
                    state.elapsed_seconds += self.interval_seconds;
                    stream
                        .append(EventInput::new(
                            types::TIME_TICK,
                            json!({ "elapsedSeconds": state.elapsed_seconds }),
                        ))
                        .await?;
                }
            }
        }
    }
}
