use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// FIFO of jobs waiting for a worker.
///
/// Popping a job hands out an [`InFlight`] guard; the queue counts as busy
/// until every guard is dropped. That is what lets a barrier wait for work
/// that has left the queue but not finished yet.
#[derive(Debug)]
pub struct JobQueue<T> {
    jobs: Mutex<VecDeque<T>>,
    available: Notify,
    in_flight: Arc<AtomicUsize>,
}

/// Marks a popped job as still being worked on.
#[derive(Debug)]
pub struct InFlight {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JobQueue<T> {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job at the back.
    pub fn push(&self, job: T) {
        self.lock().push_back(job);
        self.available.notify_one();
    }

    /// Take the oldest job, if any.
    pub fn try_pop(&self) -> Option<(T, InFlight)> {
        let mut jobs = self.lock();
        let job = jobs.pop_front()?;
        // counted while still holding the lock so is_drained never sees a gap
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some((
            job,
            InFlight {
                counter: self.in_flight.clone(),
            },
        ))
    }

    /// Wait for the oldest job.
    pub async fn pop(&self) -> (T, InFlight) {
        loop {
            let notified = self.available.notified();
            if let Some(next) = self.try_pop() {
                return next;
            }
            notified.await;
        }
    }

    /// Map every queued job, oldest first.
    pub fn snapshot<S>(&self, f: impl Fn(&T) -> S) -> Vec<S> {
        self.lock().iter().map(f).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Jobs popped but not finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Nothing queued and nothing in flight.
    pub fn is_drained(&self) -> bool {
        let jobs = self.lock();
        jobs.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
    }
}
