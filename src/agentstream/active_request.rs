//! Single-slot ownership of the in-flight LLM generation.
//!
//! [`ActiveRequest::replace`] installs a new request and interrupts the
//! previous occupant cooperatively, returning its offset so the caller can
//! record a `request-interrupted` event. Interrupt propagation is prompt:
//! the running generation observes it at its next suspension point, which
//! for a streaming generation is the next network read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::agentstream::offset::Offset;

/// Cooperative interrupt signal shared between the slot and the task
/// driving one generation.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    interrupted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Resolve once the handle is interrupted; resolves immediately if it
    /// already was.
    pub async fn wait(&self) {
        while !self.is_interrupted() {
            let notified = self.notify.notified();
            // Check again after registering to close the race with a
            // concurrent interrupt().
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }
}

/// The single slot owning the currently running generation.
#[derive(Default)]
pub struct ActiveRequest {
    slot: Mutex<Option<(Offset, InterruptHandle)>>,
}

impl ActiveRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `offset` as the active request. Interrupts the previous
    /// occupant and returns its offset, if any.
    pub fn replace(&self, offset: Offset, handle: InterruptHandle) -> Option<Offset> {
        let mut slot = self.slot.lock().expect("acquire active request slot");
        let previous = slot.replace((offset, handle));
        previous.map(|(prev_offset, prev_handle)| {
            prev_handle.interrupt();
            prev_offset
        })
    }

    /// Clear the slot iff it still holds `offset`; a newer request that
    /// already replaced it is left alone.
    pub fn clear_if(&self, offset: Offset) {
        let mut slot = self.slot.lock().expect("acquire active request slot");
        if slot.as_ref().map(|(o, _)| *o) == Some(offset) {
            *slot = None;
        }
    }

    pub fn current(&self) -> Option<Offset> {
        self.slot
            .lock()
            .expect("acquire active request slot")
            .as_ref()
            .map(|(o, _)| *o)
    }
}
