use std::{task::Waker, thread::Thread};

/// Something to notify when a waiter can make progress.
///
/// Blocking waiters park their thread, asynchronous waiters return `Pending` to their
/// executor. Both kinds share the same wait queues.
#[derive(Clone, Debug)]
pub(crate) enum Wakeup {
    Thread(Thread),
    Task(Waker),
}

impl Wakeup {
    pub(crate) fn current_thread() -> Self {
        Self::Thread(std::thread::current())
    }

    pub(crate) fn wake(self) {
        match self {
            Self::Thread(thread) => thread.unpark(),
            Self::Task(waker) => waker.wake(),
        }
    }
}
