//! The processor framework: hydrate from history, subscribe live, reduce
//! and react.
//!
//! A [`Processor`] is a named unit pinned to one path. Its `run` method
//! owns the whole lifecycle:
//!
//! 1. **Hydrate**: fold the stored prefix through a pure reducer to rebuild
//!    state, including the `last_offset` the live phase starts from.
//! 2. **Live**: consume `subscribe(from = last_offset)` event by event,
//!    reducing each into state and possibly reacting by appending further
//!    events. Reactions always receive offsets above the triggering event
//!    because `append` is awaited.
//! 3. **Supervision**: the [`StreamManager`](crate::agentstream::manager::StreamManager)
//!    wraps `run` in [`supervise`]; a failed run is logged and restarted,
//!    and the restart re-hydrates from the durable log.
//!
//! Because reactions land back in the same log, a processor that reacts
//! only to events that lack a recorded follow-up will not re-react on
//! replay: the hydrate fold observes the follow-up first. Reactive branches
//! that cannot rely on a follow-up event must count progress in state
//! instead (the codemode block extractor does this per request).

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::agentstream::error::StreamError;
use crate::agentstream::event::Event;
use crate::agentstream::offset::Offset;
use crate::agentstream::storage::ReadRange;
use crate::agentstream::stream::EventStream;

/// Delay between supervised restarts of a crashed processor.
const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// A reducer-plus-reactions unit running per path over an [`EventStream`].
#[async_trait]
pub trait Processor: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    /// Hydrate, then consume the live subscription until shutdown.
    /// Returning `Err` triggers a supervised restart; returning `Ok` ends
    /// the instance.
    async fn run(&self, stream: Arc<EventStream>) -> Result<(), StreamError>;
}

/// Fold the stored prefix of `stream` into `state` and return the offset
/// the live phase must subscribe from.
pub async fn hydrate<S, F>(
    stream: &EventStream,
    state: &mut S,
    mut reduce: F,
) -> Result<Option<Offset>, StreamError>
where
    F: FnMut(&mut S, &Event),
{
    let history = stream.read(ReadRange::default()).await?;
    let last = history.last().map(|e| e.offset);
    for event in &history {
        reduce(state, event);
    }
    Ok(last)
}

/// Spawn a supervision task that keeps `processor` running against
/// `stream`, restarting on failure after a short backoff.
pub(crate) fn supervise(processor: Arc<dyn Processor>, stream: Arc<EventStream>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            log::debug!(
                "processor '{}' starting on path '{}'",
                processor.name(),
                stream.path()
            );
            match processor.run(stream.clone()).await {
                Ok(()) => {
                    log::debug!(
                        "processor '{}' finished on path '{}'",
                        processor.name(),
                        stream.path()
                    );
                    return;
                }
                Err(e) => {
                    log::error!(
                        "processor '{}' failed on path '{}': {}; restarting",
                        processor.name(),
                        stream.path(),
                        e
                    );
                    tokio::time::sleep(RESTART_BACKOFF).await;
                }
            }
        }
    })
}
