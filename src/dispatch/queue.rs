//! The callback queue drained by a dispatch worker.

use {
    parking_lot::{Condvar, Mutex},
    std::collections::VecDeque,
};

pub(super) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO queue with any number of producers and exactly one consumer.
pub(super) struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

struct QueueState {
    jobs: VecDeque<Job>,
    shut_down: bool,
}

impl JobQueue {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                shut_down: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Appends a job.
    ///
    /// Hands the job back if the queue has been shut down.
    pub(super) fn push(&self, job: Job) -> Result<(), Job> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(job);
        }
        state.jobs.push_back(job);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Removes the oldest job, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue has been shut down.
    pub(super) fn pop(&self) -> Option<Job> {
        let mut state = self.state.lock();
        loop {
            if state.shut_down {
                return None;
            }
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            self.available.wait(&mut state);
        }
    }

    pub(super) fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub(super) fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Stops accepting jobs and wakes the consumer.
    ///
    /// Returns the jobs that were never run. They must be dropped outside of any lock
    /// since dropping a job can run arbitrary code.
    pub(super) fn shut_down(&self) -> VecDeque<Job> {
        let mut state = self.state.lock();
        state.shut_down = true;
        let abandoned = std::mem::take(&mut state.jobs);
        drop(state);
        self.available.notify_all();
        abandoned
    }
}
