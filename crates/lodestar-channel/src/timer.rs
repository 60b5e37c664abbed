//! Cancellable one-shot timers that fire onto a serializer.
//!
//! Retry and back-off timers sit on hot paths, so cancellation is a slotted
//! handle the owner retains: cancelling flips an atomic and aborts the
//! sleeping task, with no effect if the timer already fired.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::serializer::Serializer;

struct TimerShared {
    cancelled: AtomicBool,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to a scheduled timer. Dropping the handle does not cancel it.
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    /// Schedules `callback` to run on `serializer` after `delay`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn after(
        serializer: &Serializer,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let shared = Arc::new(TimerShared {
            cancelled: AtomicBool::new(false),
            task: Mutex::new(None),
        });
        let fire_shared = Arc::clone(&shared);
        let fire_serializer = serializer.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !fire_shared.cancelled.load(Ordering::Acquire) {
                fire_serializer.schedule(callback);
            }
        });
        *shared.task.lock().unwrap() = Some(task);
        TimerHandle { shared }
    }

    /// Schedules `callback` to run on `serializer` at `deadline`.
    pub fn at(
        serializer: &Serializer,
        deadline: Instant,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let delay = deadline.saturating_duration_since(Instant::now());
        TimerHandle::after(serializer, delay, callback)
    }

    /// Cancels the timer. Idempotent; a no-op once the callback has been
    /// handed to the serializer.
    pub fn cancel(&self) {
        if !self.shared.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(task) = self.shared.task.lock().unwrap().take() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.shared.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}
