//! Retry policy and per-recording retry timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Default attempt ceiling
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;

/// Default delay cap (10 minutes)
pub const DEFAULT_MAX_DELAY_MS: u64 = 600_000;

/// Retry policy for failed uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Base delay in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of attempts made so
    /// far: `initial * 2^attempts`, capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Whether another attempt is allowed after `attempts` attempts
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

struct ArmedRetry {
    generation: u64,
    delay: Duration,
    handle: JoinHandle<()>,
}

type TimerTable = Arc<Mutex<HashMap<Uuid, ArmedRetry>>>;

fn lock(timers: &Mutex<HashMap<Uuid, ArmedRetry>>) -> MutexGuard<'_, HashMap<Uuid, ArmedRetry>> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot retry timers, at most one per recording.
///
/// Arming a recording replaces (and aborts) its previous timer. A timer that
/// fires removes only its own entry, so a stale timer can never cancel a
/// newer one.
#[derive(Default)]
pub struct RetryScheduler {
    timers: TimerTable,
    generation: AtomicU64,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_fire` after `delay` unless cancelled or re-armed first.
    ///
    /// Must be called within a tokio runtime.
    pub fn schedule<F>(&self, id: Uuid, delay: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timers = Arc::clone(&self.timers);

        let mut table = lock(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let current = {
                let mut table = lock(&timers);
                match table.get(&id) {
                    Some(armed) if armed.generation == generation => {
                        table.remove(&id);
                        true
                    }
                    _ => false,
                }
            };

            if current {
                debug!(recording_id = %id, "Retry timer fired");
                on_fire();
            }
        });

        if let Some(previous) = table.insert(
            id,
            ArmedRetry {
                generation,
                delay,
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }

    /// Cancel the timer for `id`. Returns whether one was armed.
    pub fn cancel(&self, id: Uuid) -> bool {
        match lock(&self.timers).remove(&id) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every armed timer. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let mut table = lock(&self.timers);
        let count = table.len();
        for (_, armed) in table.drain() {
            armed.handle.abort();
        }
        count
    }

    pub fn is_armed(&self, id: Uuid) -> bool {
        lock(&self.timers).contains_key(&id)
    }

    /// Delay the armed timer for `id` was scheduled with
    pub fn armed_delay(&self, id: Uuid) -> Option<Duration> {
        lock(&self.timers).get(&id).map(|armed| armed.delay)
    }

    pub fn armed_count(&self) -> usize {
        lock(&self.timers).len()
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
