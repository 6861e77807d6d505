//! Latest-argument-wins debouncing with a quiet period and a maximum-wait
//! ceiling.
//!
//! A [`Debouncer`] holds the most recent value passed to `call` and fires
//! its action once `quiet` has elapsed with no new call, or unconditionally
//! once `max_wait` has elapsed since the first call of the burst. `flush`
//! fires a pending burst immediately and joins the execution; `cancel`
//! drops it.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Action<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct DebounceState<T> {
    latest: Option<T>,
    quiet_at: Instant,
    max_at: Instant,
    worker: Option<JoinHandle<()>>,
}

pub struct Debouncer<T: Send + 'static> {
    quiet: Duration,
    max_wait: Duration,
    action: Action<T>,
    state: Arc<tokio::sync::Mutex<DebounceState<T>>>,
    wake: Arc<Notify>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new<F, Fut>(quiet: Duration, max_wait: Duration, action: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let now = Instant::now();
        Debouncer {
            quiet,
            max_wait,
            action: Arc::new(move |value| Box::pin(action(value))),
            state: Arc::new(tokio::sync::Mutex::new(DebounceState {
                latest: None,
                quiet_at: now,
                max_at: now,
                worker: None,
            })),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Record `value` as the burst's latest argument and (re)arm the quiet
    /// timer. The first call of a burst also arms the max-wait ceiling and
    /// spawns the worker that will eventually fire.
    pub async fn call(&self, value: T) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.latest = Some(value);
        state.quiet_at = now + self.quiet;
        if state.worker.is_none() {
            state.max_at = now + self.max_wait;
            state.worker = Some(tokio::spawn(worker(
                self.state.clone(),
                self.wake.clone(),
                self.action.clone(),
            )));
        }
        self.wake.notify_waiters();
    }

    /// Fire a pending burst now and wait for its action to finish. A no-op
    /// when nothing is pending.
    pub async fn flush(&self) {
        let worker = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            state.quiet_at = now;
            state.max_at = now;
            state.worker.take()
        };
        self.wake.notify_waiters();
        if let Some(handle) = worker {
            let _ = handle.await;
        }
    }

    /// Drop any pending burst without firing.
    pub async fn cancel(&self) {
        let worker = {
            let mut state = self.state.lock().await;
            state.latest = None;
            state.worker.take()
        };
        if let Some(handle) = worker {
            handle.abort();
        }
    }
}

async fn worker<T: Send + 'static>(
    state: Arc<tokio::sync::Mutex<DebounceState<T>>>,
    wake: Arc<Notify>,
    action: Action<T>,
) {
    loop {
        let fire_at = {
            let st = state.lock().await;
            st.quiet_at.min(st.max_at)
        };
        if Instant::now() >= fire_at {
            break;
        }
        // Re-evaluate whenever a new call moves the quiet deadline or a
        // flush pulls both deadlines in.
        tokio::select! {
            _ = tokio::time::sleep_until(fire_at) => {}
            _ = wake.notified() => {}
        }
    }
    let value = {
        let mut st = state.lock().await;
        st.worker = None;
        st.latest.take()
    };
    if let Some(value) = value {
        action(value).await;
    }
}
