//! Path-scoped event log with hydrate-then-tail subscriptions.
//!
//! An [`EventStream`] couples a [`StreamStorage`] with an in-memory
//! [`StreamHub`] and is the single interface processors use: `append`,
//! `read`, `subscribe`.
//!
//! # Hydrate-then-tail
//!
//! `subscribe(from)` must not lose events appended during the handoff
//! between the historical read and live publication. The implementation
//! registers a live queue *before* reading history, emits the read result
//! first, then continues from the queue, dropping any live event whose
//! offset is at or below the last emitted offset. A single watermark per
//! subscription provides the deduplication.
//!
//! ```rust
//! use std::sync::Arc;
//! use agentstream::{EventInput, EventStream};
//! use agentstream::storage::MemoryStorage;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), agentstream::StreamError> {
//! let stream = EventStream::new("agent/session-1", Arc::new(MemoryStorage::new()), 1024);
//! stream.append(EventInput::new("t", serde_json::json!({"n": 1}))).await?;
//!
//! let mut sub = stream.subscribe(None).await?;
//! let first = sub.next().await.unwrap()?;
//! assert_eq!(first.payload["n"], 1);
//! # Ok(())
//! # }
//! ```

use futures_util::stream::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::agentstream::error::StreamError;
use crate::agentstream::hub::StreamHub;
use crate::agentstream::event::{Event, EventInput};
use crate::agentstream::matcher::Interceptor;
use crate::agentstream::offset::Offset;
use crate::agentstream::storage::{ReadRange, StreamStorage};

pub struct EventStream {
    path: String,
    storage: Arc<dyn StreamStorage>,
    hub: StreamHub,
    // Serializes appends at the stream level so reactions interleave
    // deterministically even when storage would allow more.
    append_lock: tokio::sync::Mutex<()>,
    // Cross-path tap installed by the StreamManager, plus interceptors
    // evaluated on the hot append path.
    tap: Option<broadcast::Sender<Event>>,
    interceptors: Vec<Arc<Interceptor>>,
}

impl EventStream {
    pub fn new(
        path: impl Into<String>,
        storage: Arc<dyn StreamStorage>,
        hub_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(EventStream {
            path: path.into(),
            storage,
            hub: StreamHub::new(hub_capacity),
            append_lock: tokio::sync::Mutex::new(()),
            tap: None,
            interceptors: Vec::new(),
        })
    }

    pub(crate) fn with_extras(
        path: impl Into<String>,
        storage: Arc<dyn StreamStorage>,
        hub_capacity: usize,
        tap: Option<broadcast::Sender<Event>>,
        interceptors: Vec<Arc<Interceptor>>,
    ) -> Arc<Self> {
        Arc::new(EventStream {
            path: path.into(),
            storage,
            hub: StreamHub::new(hub_capacity),
            append_lock: tokio::sync::Mutex::new(()),
            tap,
            interceptors,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Persist one event, assign its offset, and publish it to live
    /// subscribers. Returns the stored event.
    pub async fn append(&self, input: EventInput) -> Result<Event, StreamError> {
        let _guard = self.append_lock.lock().await;
        let event = self.storage.append(&self.path, input).await?;
        for interceptor in &self.interceptors {
            if interceptor.matches(&event) {
                interceptor.invoke(&event);
            }
        }
        self.hub.publish(event.clone());
        if let Some(tap) = &self.tap {
            let _ = tap.send(event.clone());
        }
        Ok(event)
    }

    /// Finite range read; see [`ReadRange`] for the bound conventions.
    pub async fn read(&self, range: ReadRange) -> Result<Vec<Event>, StreamError> {
        self.storage.read(&self.path, range).await
    }

    /// Events with `offset > from` (all events when `from` is `None`), in
    /// strictly increasing offset order, continuing indefinitely with new
    /// appends. Ends only when the subscription is dropped or the consumer
    /// falls behind the live queue.
    pub async fn subscribe(&self, from: Option<Offset>) -> Result<EventSubscription, StreamError> {
        // Live queue registered before the history read; anything appended
        // during the read is buffered and deduplicated by the watermark.
        let live = self.hub.subscribe();
        let history = self.read(ReadRange::after(from)).await?;
        Ok(EventSubscription {
            history: history.into(),
            live,
            watermark: from,
            dead: false,
        })
    }

    /// Number of live subscriber queues (used by the testing harness to
    /// await processor startup).
    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }
}

/// A possibly-infinite ordered sequence of events for one path.
pub struct EventSubscription {
    history: VecDeque<Event>,
    live: broadcast::Receiver<Event>,
    watermark: Option<Offset>,
    dead: bool,
}

impl EventSubscription {
    /// The next event, `None` once the subscription has terminated, or
    /// `Some(Err(BackpressureDrop))` once if this subscriber fell behind.
    /// A backpressure drop is terminal; resubscribe from
    /// [`last_offset`](EventSubscription::last_offset) to continue.
    pub async fn next(&mut self) -> Option<Result<Event, StreamError>> {
        if self.dead {
            return None;
        }
        if let Some(event) = self.history.pop_front() {
            self.watermark = Some(event.offset);
            return Some(Ok(event));
        }
        loop {
            match self.live.recv().await {
                Ok(event) => {
                    // Drop live events already emitted from history.
                    if let Some(mark) = self.watermark {
                        if event.offset <= mark {
                            continue;
                        }
                    }
                    self.watermark = Some(event.offset);
                    return Some(Ok(event));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    self.dead = true;
                    return Some(Err(StreamError::BackpressureDrop));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Last offset handed to the consumer, useful for resubscribing after a
    /// backpressure drop.
    pub fn last_offset(&self) -> Option<Offset> {
        self.watermark
    }

    /// Adapt to a [`futures_util::Stream`] (used by the SSE transport).
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = Result<Event, StreamError>> + Send>> {
        Box::pin(futures_util::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|item| (item, sub))
        }))
    }
}
