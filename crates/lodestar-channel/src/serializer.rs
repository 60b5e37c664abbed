//! Single-threaded cooperative executors ("serializers").
//!
//! A serializer provides mutual exclusion without per-field locks: callers
//! enqueue closures and exactly one worker at a time drains the queue in FIFO
//! order. The channel, each LB policy, and each call own one serializer; all
//! of an entity's state mutations run inside closures scheduled on its
//! serializer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A unit of work queued on a serializer.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// FIFO closure queue with an at-most-one-drainer guarantee.
///
/// `schedule` enqueues the closure and, if no drain is in progress, drains the
/// queue inline on the calling thread. Closures scheduled from within a
/// running closure are appended and run before the drain finishes, preserving
/// submission order.
#[derive(Clone, Default)]
pub struct Serializer {
    inner: Arc<SerializerInner>,
}

#[derive(Default)]
struct SerializerInner {
    queue: Mutex<VecDeque<Task>>,
    draining: AtomicBool,
}

impl Serializer {
    /// Creates an empty serializer.
    pub fn new() -> Serializer {
        Serializer::default()
    }

    /// Enqueues `task` and drains the queue if no other thread is draining.
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) {
        self.inner
            .queue
            .lock()
            .unwrap()
            .push_back(Box::new(task));
        self.drain();
    }

    /// Number of tasks waiting (excluding any currently running task).
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    fn drain(&self) {
        loop {
            if self.inner.draining.swap(true, Ordering::AcqRel) {
                // Another thread owns the drain; it will observe our task.
                return;
            }
            loop {
                let task = self.inner.queue.lock().unwrap().pop_front();
                match task {
                    Some(task) => task(),
                    None => break,
                }
            }
            self.inner.draining.store(false, Ordering::Release);
            // A task may have been enqueued between the final pop and the
            // flag clear; re-take the drain if so.
            if self.inner.queue.lock().unwrap().is_empty() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Serializer")
            .field("queued", &self.queued())
            .finish()
    }
}
