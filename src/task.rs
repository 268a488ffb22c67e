//! Generation-stamped cancellable background work.
//!
//! Filtering, enrichment, search and coverage loading all follow the same
//! shape: capture a snapshot, run the computation off the caller's thread,
//! and publish the result only if nothing newer was started meanwhile.
//! Starting a new unit bumps the generation, which is also the cancellation
//! signal for every older unit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::ReentrantMutex;
use tracing::{debug, warn};

use crate::error::Cancelled;

/// Proof of which generation a unit of work belongs to.
#[derive(Debug, Clone)]
pub struct Ticket {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl Ticket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.generation
    }

    /// Call at each unit of work; bail out with `?` once superseded.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_current() {
            Ok(())
        } else {
            Err(Cancelled)
        }
    }
}

/// A running unit spawned by [`GenerationalTask::spawn`].
#[derive(Debug)]
pub struct Spawned {
    pub ticket: Ticket,
    handle: Option<JoinHandle<()>>,
}

impl Spawned {
    /// Wait for the worker thread to finish, whether it applied or not.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationalTask {
    name: &'static str,
    generation: Arc<AtomicU64>,
    /// Reentrant so an applier may cancel its own task.
    apply_lock: Arc<ReentrantMutex<()>>,
}

impl GenerationalTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            generation: Arc::new(AtomicU64::new(0)),
            apply_lock: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Start a new generation, cancelling whatever ran before.
    pub fn begin(&self) -> Ticket {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        Ticket {
            generation,
            current: Arc::clone(&self.generation),
        }
    }

    /// Cancel the in-flight unit without starting another.
    ///
    /// Returns once no applier of an older generation is running, so nothing
    /// from the cancelled unit lands after this call.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        drop(self.apply_lock.lock());
    }

    /// Run `apply` only if `ticket` is still the newest generation.
    ///
    /// Appliers are serialized, so a result is never published concurrently
    /// with another result from the same task.
    pub fn apply_if_current<R>(&self, ticket: &Ticket, apply: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.apply_lock.lock();
        if ticket.is_current() {
            Some(apply())
        } else {
            None
        }
    }

    /// Begin a generation and run `work` on a worker thread after `debounce`.
    ///
    /// `apply` receives the result only if the generation is still current
    /// when the work completes.
    pub fn spawn<T, W, A>(&self, debounce: Duration, work: W, apply: A) -> Spawned
    where
        T: Send + 'static,
        W: FnOnce(&Ticket) -> Result<T, Cancelled> + Send + 'static,
        A: FnOnce(T) + Send + 'static,
    {
        let ticket = self.begin();
        let worker_ticket = ticket.clone();
        let task = self.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("sessiondex-{}", self.name))
            .spawn(move || {
                if !debounce.is_zero() {
                    std::thread::sleep(debounce);
                }
                let outcome = worker_ticket.checkpoint().and_then(|()| work(&worker_ticket));
                match outcome {
                    Ok(result) => {
                        if task.apply_if_current(&worker_ticket, || apply(result)).is_none() {
                            debug!(task = task.name, generation = worker_ticket.generation, "discarding stale result");
                        }
                    }
                    Err(Cancelled) => {
                        debug!(task = task.name, generation = worker_ticket.generation, "cancelled");
                    }
                }
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(task = self.name, error = %e, "failed to spawn worker thread");
                None
            }
        };
        Spawned { ticket, handle }
    }
}
