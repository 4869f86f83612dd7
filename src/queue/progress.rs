//! Upload progress fan-out.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;
use uuid::Uuid;

use crate::domain::ProgressEvent;

/// Handle returned by [`ProgressNotifier::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Registry of progress observers.
///
/// Observers are called synchronously in registration order. A panicking
/// observer is logged and skipped; it never reaches the upload processor or
/// the remaining observers.
#[derive(Default)]
pub struct ProgressNotifier {
    observers: RwLock<Vec<(ObserverId, Observer)>>,
    next_id: AtomicU64,
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn notify(&self, recording_id: Uuid, percent: u8) {
        let event = ProgressEvent::new(recording_id, percent);

        // Snapshot so observers may (un)subscribe from inside a callback
        let observers: Vec<(ObserverId, Observer)> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, observer) in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                warn!(observer = id.0, recording_id = %recording_id, "Progress observer panicked");
            }
        }
    }
}
