//! Durable, ordered, per-path event storage.
//!
//! [`StreamStorage`] is the substrate every [`EventStream`](crate::agentstream::stream::EventStream)
//! sits on: it assigns monotonic offsets, stamps `createdAt` and trace
//! context, and serves finite range reads. Two implementations ship:
//!
//! - [`MemoryStorage`]: a thread-safe map of vectors, used by the testing
//!   harness and anywhere durability is not needed.
//! - [`FileStorage`]: one append-only `.jsonl` file per path under a root
//!   directory, one JSON document per line. File names are the URL-encoded
//!   stream path, so `"agent/session-1"` persists as
//!   `agent%2Fsession-1.jsonl`.
//!
//! A successful `append` is durable: a subsequent `read` from the same or a
//! restarted process observes the event. Reads capture a snapshot at
//! initiation time and do not follow later appends.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::AsyncWriteExt;

use crate::agentstream::error::StreamError;
use crate::agentstream::event::{Event, EventInput, StreamPath, TraceContext};
use crate::agentstream::offset::Offset;

/// Bounds for a range read: `from` is an exclusive lower bound, `to` an
/// inclusive upper bound. Either side absent means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadRange {
    pub from: Option<Offset>,
    pub to: Option<Offset>,
}

impl ReadRange {
    /// Everything after `from` (exclusive).
    pub fn after(from: Option<Offset>) -> Self {
        ReadRange { from, to: None }
    }

    fn contains(&self, offset: Offset) -> bool {
        if let Some(from) = self.from {
            if offset <= from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if offset > to {
                return false;
            }
        }
        true
    }
}

/// A durable, ordered, per-path event log.
///
/// Appends to a single path are serialized; appends to different paths may
/// proceed in parallel. Reads never block appends and observe a consistent
/// prefix.
#[async_trait]
pub trait StreamStorage: Send + Sync {
    /// Assign the next offset for `path`, stamp `createdAt` and trace,
    /// persist, and return the stored event.
    async fn append(&self, path: &str, input: EventInput) -> Result<Event, StreamError>;

    /// All events for `path` within `range`, in offset order. The result is
    /// finite: it reflects the path at read-initiation time.
    async fn read(&self, path: &str, range: ReadRange) -> Result<Vec<Event>, StreamError>;

    /// Best-effort enumeration of known paths.
    async fn list_paths(&self) -> Result<Vec<StreamPath>, StreamError>;
}

fn stamp(path: &str, offset: Offset, input: EventInput) -> Event {
    Event {
        path: path.to_string(),
        offset,
        event_type: input.event_type,
        payload: input.payload,
        version: input.version,
        created_at: Utc::now(),
        trace: Some(input.trace.unwrap_or_else(TraceContext::root)),
    }
}

/// In-memory [`StreamStorage`] backed by a map of vectors.
///
/// Offsets are dense, so the vector index of an event equals its offset and
/// range reads are a slice.
#[derive(Default)]
pub struct MemoryStorage {
    streams: RwLock<HashMap<String, Vec<Event>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamStorage for MemoryStorage {
    async fn append(&self, path: &str, input: EventInput) -> Result<Event, StreamError> {
        let mut streams = self
            .streams
            .write()
            .expect("acquire write lock on memory storage");
        let events = streams.entry(path.to_string()).or_default();
        let event = stamp(path, Offset::new(events.len() as u64), input);
        events.push(event.clone());
        Ok(event)
    }

    async fn read(&self, path: &str, range: ReadRange) -> Result<Vec<Event>, StreamError> {
        let streams = self
            .streams
            .read()
            .expect("acquire read lock on memory storage");
        Ok(streams
            .get(path)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| range.contains(e.offset))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_paths(&self) -> Result<Vec<StreamPath>, StreamError> {
        let streams = self
            .streams
            .read()
            .expect("acquire read lock on memory storage");
        let mut paths: Vec<_> = streams.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }
}

struct PathState {
    // None until the file has been scanned once after open.
    next_offset: Option<u64>,
}

/// File-backed [`StreamStorage`]: one append-only newline-delimited JSON
/// file per path, one full [`Event`] document per line.
///
/// The per-path next offset is cached after the first touch so that appends
/// do not rescan the file; a restarted process rebuilds the cache lazily
/// from the last line of each file.
pub struct FileStorage {
    root: PathBuf,
    // Path registry guarded by a sync lock; per-path IO serialized by the
    // async mutex inside each entry so different paths append in parallel.
    paths: Mutex<HashMap<String, Arc<tokio::sync::Mutex<PathState>>>>,
}

impl FileStorage {
    /// Open (creating the root directory if needed) a file storage rooted
    /// at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StreamError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(FileStorage {
            root,
            paths: Mutex::new(HashMap::new()),
        })
    }

    fn file_for(&self, path: &str) -> PathBuf {
        self.root
            .join(format!("{}.jsonl", urlencoding::encode(path)))
    }

    fn entry_for(&self, path: &str) -> Arc<tokio::sync::Mutex<PathState>> {
        let mut paths = self.paths.lock().expect("acquire path registry lock");
        paths
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(PathState { next_offset: None })))
            .clone()
    }

    async fn load_events(&self, path: &str) -> Result<Vec<Event>, StreamError> {
        let file = self.file_for(path);
        let contents = match tokio::fs::read_to_string(&file).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str::<Event>(line)?);
        }
        Ok(events)
    }
}

#[async_trait]
impl StreamStorage for FileStorage {
    async fn append(&self, path: &str, input: EventInput) -> Result<Event, StreamError> {
        let entry = self.entry_for(path);
        let mut state = entry.lock().await;
        let next_offset = match state.next_offset {
            Some(next) => next,
            None => {
                // First touch since open: recover the sequence from disk.
                let existing = self.load_events(path).await?;
                existing.last().map(|e| e.offset.value() + 1).unwrap_or(0)
            }
        };
        let event = stamp(path, Offset::new(next_offset), input);
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(path))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        state.next_offset = Some(next_offset + 1);
        Ok(event)
    }

    async fn read(&self, path: &str, range: ReadRange) -> Result<Vec<Event>, StreamError> {
        Ok(self
            .load_events(path)
            .await?
            .into_iter()
            .filter(|e| range.contains(e.offset))
            .collect())
    }

    async fn list_paths(&self) -> Result<Vec<StreamPath>, StreamError> {
        let mut paths = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(encoded) = name.strip_suffix(".jsonl") {
                match urlencoding::decode(encoded) {
                    Ok(decoded) => paths.push(decoded.into_owned()),
                    Err(_) => log::warn!("skipping undecodable stream file {:?}", name),
                }
            }
        }
        paths.sort();
        Ok(paths)
    }
}
