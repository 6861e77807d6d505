//! Registry of per-path event streams and the processors pinned to them.
//!
//! A [`StreamManager`] creates [`EventStream`]s lazily on first reference
//! and, on creation, spawns one supervised instance of each registered
//! processor for that path. It also offers cross-path reads and
//! subscriptions that merge every path: ordering is FIFO within a path,
//! interleaving between paths is unspecified but monotone.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentstream::{StreamManager, EventInput};
//! use agentstream::storage::MemoryStorage;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), agentstream::StreamError> {
//! let manager = StreamManager::new(Arc::new(MemoryStorage::new())).build();
//! let stream = manager.open("agent/session-1").await;
//! stream.append(EventInput::new("t", serde_json::json!({}))).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::agentstream::error::StreamError;
use crate::agentstream::event::Event;
use crate::agentstream::matcher::Interceptor;
use crate::agentstream::offset::Offset;
use crate::agentstream::processor::{supervise, Processor};
use crate::agentstream::storage::{ReadRange, StreamStorage};
use crate::agentstream::stream::EventStream;

/// Builder for a [`StreamManager`]; register processors and interceptors
/// before the first path is opened.
pub struct StreamManagerBuilder {
    storage: Arc<dyn StreamStorage>,
    processors: Vec<Arc<dyn Processor>>,
    interceptors: Vec<Arc<Interceptor>>,
    hub_capacity: usize,
}

impl StreamManagerBuilder {
    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn with_interceptor(mut self, interceptor: Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Subscriber queue depth for each path's live hub.
    pub fn with_hub_capacity(mut self, capacity: usize) -> Self {
        self.hub_capacity = capacity;
        self
    }

    pub fn build(self) -> Arc<StreamManager> {
        let (global, _) = broadcast::channel(self.hub_capacity);
        Arc::new(StreamManager {
            storage: self.storage,
            processors: self.processors,
            interceptors: self.interceptors,
            hub_capacity: self.hub_capacity,
            global,
            inner: Mutex::new(ManagerInner {
                streams: HashMap::new(),
                supervisors: Vec::new(),
            }),
        })
    }
}

struct ManagerInner {
    streams: HashMap<String, Arc<EventStream>>,
    supervisors: Vec<JoinHandle<()>>,
}

pub struct StreamManager {
    storage: Arc<dyn StreamStorage>,
    processors: Vec<Arc<dyn Processor>>,
    interceptors: Vec<Arc<Interceptor>>,
    hub_capacity: usize,
    // Tap receiving every event of every managed stream, for cross-path
    // subscriptions.
    global: broadcast::Sender<Event>,
    inner: Mutex<ManagerInner>,
}

impl StreamManager {
    pub fn new(storage: Arc<dyn StreamStorage>) -> StreamManagerBuilder {
        StreamManagerBuilder {
            storage,
            processors: Vec::new(),
            interceptors: Vec::new(),
            hub_capacity: 1024,
        }
    }

    /// The stream for `path`, created on first reference. Creation spawns
    /// one supervised instance of every registered processor, pinned to the
    /// path.
    pub async fn open(self: &Arc<Self>, path: &str) -> Arc<EventStream> {
        let mut inner = self.inner.lock().expect("acquire stream registry lock");
        if let Some(stream) = inner.streams.get(path) {
            return stream.clone();
        }
        let stream = EventStream::with_extras(
            path,
            self.storage.clone(),
            self.hub_capacity,
            Some(self.global.clone()),
            self.interceptors.clone(),
        );
        inner.streams.insert(path.to_string(), stream.clone());
        for processor in &self.processors {
            inner
                .supervisors
                .push(supervise(processor.clone(), stream.clone()));
        }
        stream
    }

    /// Open every path already present in storage. Used on startup so that
    /// processors resume work recorded before the restart.
    pub async fn open_existing(self: &Arc<Self>) -> Result<(), StreamError> {
        for path in self.storage.list_paths().await? {
            self.open(&path).await;
        }
        Ok(())
    }

    /// Paths currently managed (opened) by this manager.
    pub fn open_paths(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("acquire stream registry lock");
        let mut paths: Vec<_> = inner.streams.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Merge of all stored paths: each path's events with `offset > from`
    /// (applied per path, since offsets are not comparable across paths),
    /// concatenated path by path in sorted path order.
    pub async fn read_all(&self, from: Option<Offset>) -> Result<Vec<Event>, StreamError> {
        let mut merged = Vec::new();
        for path in self.storage.list_paths().await? {
            merged.extend(self.storage.read(&path, ReadRange::after(from)).await?);
        }
        Ok(merged)
    }

    /// Merged subscription over every managed path, hydrating each path's
    /// history first and then tailing the shared live fan-out. `from` is
    /// applied per path. Only paths opened through this manager feed the
    /// live phase.
    pub async fn subscribe_all(
        self: &Arc<Self>,
        from: Option<Offset>,
    ) -> Result<MergedSubscription, StreamError> {
        // Tap first, history second, exactly as the per-path protocol.
        let live = self.global.subscribe();
        let history = self.read_all(from).await?;
        let mut watermarks = HashMap::new();
        for event in &history {
            watermarks.insert(event.path.clone(), event.offset);
        }
        Ok(MergedSubscription {
            history: history.into(),
            live,
            from,
            watermarks,
        })
    }

    /// Abort all processor supervisors. Streams stay readable; the durable
    /// log is untouched.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("acquire stream registry lock");
        for handle in inner.supervisors.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cross-path subscription: per-path FIFO with per-path deduplication
/// watermarks.
pub struct MergedSubscription {
    history: VecDeque<Event>,
    live: broadcast::Receiver<Event>,
    from: Option<Offset>,
    watermarks: HashMap<String, Offset>,
}

impl MergedSubscription {
    pub async fn next(&mut self) -> Option<Result<Event, StreamError>> {
        if let Some(event) = self.history.pop_front() {
            return Some(Ok(event));
        }
        loop {
            match self.live.recv().await {
                Ok(event) => {
                    let mark = self.watermarks.get(&event.path).copied().or(self.from);
                    if let Some(mark) = mark {
                        if event.offset <= mark {
                            continue;
                        }
                    }
                    self.watermarks.insert(event.path.clone(), event.offset);
                    return Some(Ok(event));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return Some(Err(StreamError::BackpressureDrop));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentstream::event::EventInput;
    use crate::agentstream::storage::MemoryStorage;

    #[tokio::test]
    async fn test_open_is_lazy_and_idempotent() {
        let manager = StreamManager::new(Arc::new(MemoryStorage::new())).build();
        let a = manager.open("p").await;
        let b = manager.open("p").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.open_paths(), vec!["p".to_string()]);
    }

    #[tokio::test]
    async fn test_merged_subscription_spans_paths() {
        let manager = StreamManager::new(Arc::new(MemoryStorage::new())).build();
        let a = manager.open("a").await;
        let b = manager.open("b").await;
        a.append(EventInput::new("t", serde_json::json!({"n": 1})))
            .await
            .unwrap();

        let mut sub = manager.subscribe_all(None).await.unwrap();
        b.append(EventInput::new("t", serde_json::json!({"n": 2})))
            .await
            .unwrap();

        let first = sub.next().await.unwrap().unwrap();
        assert_eq!(first.path, "a");
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(second.path, "b");
    }

    #[tokio::test]
    async fn test_merged_subscription_deduplicates_per_path() {
        let manager = StreamManager::new(Arc::new(MemoryStorage::new())).build();
        let a = manager.open("a").await;
        a.append(EventInput::new("t", serde_json::json!({"n": 1})))
            .await
            .unwrap();

        // An append racing the handoff lands in both history and the live
        // tap; the per-path watermark must drop the duplicate.
        let mut sub = manager.subscribe_all(None).await.unwrap();
        a.append(EventInput::new("t", serde_json::json!({"n": 2})))
            .await
            .unwrap();

        let mut offsets = Vec::new();
        for _ in 0..2 {
            offsets.push(sub.next().await.unwrap().unwrap().offset.value());
        }
        assert_eq!(offsets, vec![0, 1]);
    }
}
