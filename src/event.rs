//! One-shot Events
//!
//! Single-resolution events used for every blocking point of a context:
//! window waits, frame waits, activation ordering, ownership lookups and
//! top-view creation. A `UserEvent` is triggered by any thread exactly once;
//! any number of `Event` handles may wait on it, before or after the trigger.

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

struct EventInner {
    triggered: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<()>>>,
    receiver: Shared<oneshot::Receiver<()>>,
}

/// Handle that waits for a `UserEvent`. `Event::no_event()` is already
/// triggered.
#[derive(Clone, Default)]
pub struct Event {
    inner: Option<Arc<EventInner>>,
}

impl Event {
    pub fn no_event() -> Self {
        Self { inner: None }
    }

    pub fn exists(&self) -> bool {
        self.inner.is_some()
    }

    pub fn has_triggered(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.triggered.load(Ordering::Acquire),
            None => true,
        }
    }

    /// Wait for the trigger. Returns immediately for triggered events.
    pub async fn wait(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.triggered.load(Ordering::Acquire) {
            return;
        }
        // Waiting handles keep the sender alive, so only `trigger` resolves
        // this. Dropping every `UserEvent` without triggering leaves waiters
        // pending.
        let _ = inner.receiver.clone().await;
    }

    /// Wait for every event in `events`.
    pub async fn wait_all(events: &[Event]) {
        for event in events {
            event.wait().await;
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("exists", &self.exists())
            .field("triggered", &self.has_triggered())
            .finish()
    }
}

/// An event triggered explicitly by user code.
#[derive(Clone)]
pub struct UserEvent {
    inner: Arc<EventInner>,
}

impl Default for UserEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl UserEvent {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            inner: Arc::new(EventInner {
                triggered: AtomicBool::new(false),
                sender: Mutex::new(Some(tx)),
                receiver: rx.shared(),
            }),
        }
    }

    pub fn event(&self) -> Event {
        Event {
            inner: Some(self.inner.clone()),
        }
    }

    /// Trigger the event. Returns false if it had already been triggered.
    pub fn trigger(&self) -> bool {
        let sender = self.inner.sender.lock().take();
        match sender {
            Some(tx) => {
                self.inner.triggered.store(true, Ordering::Release);
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn has_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserEvent")
            .field("triggered", &self.has_triggered())
            .finish()
    }
}
