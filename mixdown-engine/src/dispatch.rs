//! Controlling-thread task dispatch
//!
//! Background threads never call user code directly. They post closures to a
//! [`Dispatcher`], and whoever owns the matching [`EventLoop`] runs them in
//! order on the controlling thread.
//!
//! [`GenerationCounter`] tags work with the seek generation it was started
//! for, so a completion can be dropped at delivery time if a newer request
//! superseded it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Unit of work executed on the controlling thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Monotonic request generation shared between a requester and its worker.
///
/// Every new request advances the counter; work tagged with an older value is
/// stale.
#[derive(Debug, Clone, Default)]
pub struct GenerationCounter(Arc<AtomicU64>);

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advance and return the new generation
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }
}

/// Sending half: clone freely and hand to worker threads
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Task>,
}

impl Dispatcher {
    /// Queue `task` for the controlling thread.
    ///
    /// Returns false if the event loop is gone; the task is dropped unrun.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(task)).is_ok()
    }

    /// Queue `task`, but only run it if `counter` still reads `generation`
    /// when the controlling thread gets to it.
    pub fn post_if_current<F>(&self, counter: &GenerationCounter, generation: u64, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let counter = counter.clone();
        self.post(move || {
            if counter.is_current(generation) {
                task();
            } else {
                trace!(
                    "Dropping completion for generation {} (now {})",
                    generation,
                    counter.current()
                );
            }
        })
    }
}

/// Receiving half, owned by the controlling thread
pub struct EventLoop {
    tx: mpsc::UnboundedSender<Task>,
    rx: mpsc::UnboundedReceiver<Task>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            tx: self.tx.clone(),
        }
    }

    /// Run every task queued so far, including tasks those tasks post.
    /// Never blocks. Returns the number of tasks run.
    pub fn pump(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Wait for the next task and run it.
    ///
    /// Cancel-safe: a task is either run in full or left queued.
    pub async fn next(&mut self) {
        // The loop holds a sender, so the channel never closes
        if let Some(task) = self.rx.recv().await {
            task();
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
