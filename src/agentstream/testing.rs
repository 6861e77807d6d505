//! In-memory test harness for processors and end-to-end scenarios.
//!
//! [`TestStream`] wraps an [`EventStream`] over [`MemoryStorage`] and adds
//! the waiting primitives integration tests need: `append_event`,
//! `wait_for_subscribers` (processor startup), and `wait_for_event` with a
//! per-type consumption cursor so successive waits for the same type
//! return successive events.
//!
//! [`ScriptedModel`] is a [`LanguageModel`] whose responses are scripted
//! step by step, including hold points that keep a generation open until
//! the test releases it; that is what interrupt tests hang off.
//! [`MockFetcher`] serves canned JSON bodies by URL substring.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::agentstream::codemode::sandbox::{FetchRequest, FetchResponse, Fetcher};
use crate::agentstream::error::StreamError;
use crate::agentstream::event::{Event, EventInput};
use crate::agentstream::language_model::{
    HistoryMessage, LanguageModel, ResponsePart, ResponsePartStream,
};
use crate::agentstream::offset::Offset;
use crate::agentstream::storage::{MemoryStorage, ReadRange};
use crate::agentstream::stream::EventStream;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct TestStream {
    stream: Arc<EventStream>,
    cursors: Mutex<HashMap<String, Offset>>,
}

impl TestStream {
    pub fn new() -> Self {
        Self::with_path("test/stream")
    }

    pub fn with_path(path: &str) -> Self {
        TestStream {
            stream: EventStream::new(path, Arc::new(MemoryStorage::new()), 1024),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Wrap an existing stream (e.g. one opened through a manager).
    pub fn wrap(stream: Arc<EventStream>) -> Self {
        TestStream {
            stream,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn stream(&self) -> Arc<EventStream> {
        self.stream.clone()
    }

    pub async fn append_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Event, StreamError> {
        self.stream
            .append(EventInput::new(event_type, payload))
            .await
    }

    /// Wait until at least `count` live subscribers are registered, i.e.
    /// the processors under test reached their live phase.
    ///
    /// # Panics
    ///
    /// Panics after five seconds; test harness only.
    pub async fn wait_for_subscribers(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while self.stream.subscriber_count() < count {
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for {} subscribers on '{}' (have {})",
                    count,
                    self.stream.path(),
                    self.stream.subscriber_count()
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait for the next event of `event_type` past this harness's
    /// consumption cursor for that type, and advance the cursor. Each event
    /// is returned exactly once per harness.
    ///
    /// # Panics
    ///
    /// Panics after five seconds; test harness only.
    pub async fn wait_for_event(&self, event_type: &str) -> Event {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let from = self.cursors.lock().unwrap().get(event_type).copied();
            let events = self
                .stream
                .read(ReadRange::after(from))
                .await
                .expect("read test stream");
            if let Some(event) = events.into_iter().find(|e| e.event_type == event_type) {
                self.cursors
                    .lock()
                    .unwrap()
                    .insert(event_type.to_string(), event.offset);
                return event;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for '{}' on '{}'",
                    event_type,
                    self.stream.path()
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Assert that no event of `event_type` beyond the cursor appears
    /// within `window`.
    pub async fn assert_no_event(&self, event_type: &str, window: Duration) {
        tokio::time::sleep(window).await;
        let from = self.cursors.lock().unwrap().get(event_type).copied();
        let events = self
            .stream
            .read(ReadRange::after(from))
            .await
            .expect("read test stream");
        if let Some(event) = events.iter().find(|e| e.event_type == event_type) {
            panic!(
                "unexpected '{}' at offset {} on '{}'",
                event_type,
                event.offset,
                self.stream.path()
            );
        }
    }
}

impl Default for TestStream {
    fn default() -> Self {
        TestStream::new()
    }
}

/// One step of a scripted generation.
pub enum ScriptStep {
    /// Yield a part.
    Part(ResponsePart),
    /// Sleep before the next step.
    Wait(Duration),
    /// Block until the test calls [`ScriptedModel::release`].
    Hold,
    /// Fail the stream with the given message.
    Fail(String),
}

/// Convenience constructors for scripted text responses.
impl ScriptStep {
    pub fn delta(id: &str, text: &str) -> ScriptStep {
        ScriptStep::Part(ResponsePart::TextDelta {
            id: id.to_string(),
            delta: text.to_string(),
        })
    }
}

/// A language model whose generations replay pre-arranged scripts.
pub struct ScriptedModel {
    model: String,
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    release: Arc<Semaphore>,
}

impl ScriptedModel {
    pub fn new(model: impl Into<String>) -> Self {
        ScriptedModel {
            model: model.into(),
            scripts: Mutex::new(VecDeque::new()),
            release: Arc::new(Semaphore::new(0)),
        }
    }

    /// Queue the script for the next generation.
    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    /// Queue a plain text response streamed as start, one delta per word,
    /// end.
    pub fn push_text(&self, text: &str) {
        let id = format!("text-{}", uuid::Uuid::new_v4().simple());
        let mut steps = vec![ScriptStep::Part(ResponsePart::TextStart { id: id.clone() })];
        for word in text.split_inclusive(' ') {
            steps.push(ScriptStep::delta(&id, word));
        }
        steps.push(ScriptStep::Part(ResponsePart::TextEnd { id }));
        self.push_script(steps);
    }

    /// Unblock one [`ScriptStep::Hold`].
    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn stream_generation(
        &self,
        _prompt: &[HistoryMessage],
    ) -> Result<ResponsePartStream, Box<dyn Error + Send + Sync>> {
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or("no script queued for generation")?;
        let release = self.release.clone();

        struct StreamState {
            steps: VecDeque<ScriptStep>,
            release: Arc<Semaphore>,
        }
        let state = StreamState {
            steps: steps.into(),
            release,
        };
        Ok(Box::pin(futures_util::stream::unfold(
            state,
            |mut state| async move {
                while let Some(step) = state.steps.pop_front() {
                    match step {
                        ScriptStep::Part(part) => return Some((Ok(part), state)),
                        ScriptStep::Wait(duration) => tokio::time::sleep(duration).await,
                        ScriptStep::Hold => {
                            let permit = state
                                .release
                                .acquire()
                                .await
                                .expect("scripted model release semaphore closed");
                            permit.forget();
                        }
                        ScriptStep::Fail(message) => {
                            return Some((Err(message.into()), state));
                        }
                    }
                }
                None
            },
        )))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Mock `fetch` capability serving canned JSON bodies by URL substring.
pub struct MockFetcher {
    routes: Vec<(String, serde_json::Value)>,
}

impl MockFetcher {
    pub fn new() -> Self {
        MockFetcher { routes: Vec::new() }
    }

    /// Serve `body` for any URL containing `url_fragment`.
    pub fn route(mut self, url_fragment: &str, body: serde_json::Value) -> Self {
        self.routes.push((url_fragment.to_string(), body));
        self
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        MockFetcher::new()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        request: FetchRequest,
    ) -> Result<FetchResponse, Box<dyn Error + Send + Sync>> {
        for (fragment, body) in &self.routes {
            if request.url.contains(fragment) {
                return Ok(FetchResponse {
                    status: 200,
                    headers: HashMap::new(),
                    body: body.to_string(),
                });
            }
        }
        Err(format!("no mock route for {}", request.url).into())
    }
}
