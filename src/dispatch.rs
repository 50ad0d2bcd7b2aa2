//! The pluggable serial executor used for listener callback delivery
//! (spec §6 "Event-delivery collaborator").
//!
//! Notifications must never run synchronously on the receiver thread; they
//! are handed to an `EventDispatcher` which runs them, in submission order,
//! on a single worker. Hosts with their own UI event loop can supply their
//! own implementation; `ThreadDispatcher` is the default in-process worker.

use std::sync::mpsc;
use std::thread;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait EventDispatcher: Send + Sync {
    fn submit(&self, job: Job);
}

/// Single dedicated worker thread draining a FIFO queue. This is the
/// library-owned executor spec §6 falls back to when the host hasn't
/// supplied one.
pub struct ThreadDispatcher {
    tx: mpsc::Sender<Job>,
}

impl ThreadDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("prodjlink-dispatch".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("failed to spawn event dispatch thread");
        ThreadDispatcher { tx }
    }
}

impl Default for ThreadDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher for ThreadDispatcher {
    fn submit(&self, job: Job) {
        // The worker thread only exits if the sender is dropped, so a send
        // failure here would mean the dispatcher itself was torn down; drop
        // the job silently rather than panic on a dying executor.
        let _ = self.tx.send(job);
    }
}

/// Runs jobs inline on the calling thread. Useful in tests that want
/// synchronous, ordering-obvious delivery without a background thread.
pub struct InlineDispatcher;

impl EventDispatcher for InlineDispatcher {
    fn submit(&self, job: Job) {
        job();
    }
}
