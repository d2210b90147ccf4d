use {
    crate::wakeup::Wakeup,
    parking_lot::Mutex,
    std::{
        fmt::{Debug, Formatter},
        future::Future,
        pin::Pin,
        sync::{
            Arc,
            atomic::{
                AtomicBool,
                Ordering::{Acquire, Release},
            },
        },
        task::{Context, Poll},
    },
    tracing::trace,
};


/// A signal that asks waiting lock acquisitions to give up.
///
/// Clones share the same signal. Cancellation is permanent.
///
/// Cancellation is only observed while a call is genuinely waiting for a lock. A call
/// that finds the lock free, or that re-enters a lock its flow already holds, succeeds
/// even if the token has been cancelled.
///
/// # Example
///
/// ```
/// use flowlock::{CancellationToken, LockError, ReentrantMutex};
///
/// let mutex = ReentrantMutex::default();
/// let token = CancellationToken::new();
/// token.cancel();
/// mutex.with_lock(|| {
///     std::thread::scope(|s| {
///         let waiter = s.spawn(|| mutex.with_lock_cancellable(&token, || ()));
///         assert_eq!(waiter.join().unwrap(), Err(LockError::Cancelled));
///     });
/// });
/// // Nothing to wait for, so the cancelled token is not consulted.
/// assert_eq!(mutex.with_lock_cancellable(&token, || 1), Ok(1));
/// ```
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    waiters: Mutex<Waiters>,
}

#[derive(Default)]
struct Waiters {
    next_key: u64,
    entries: Vec<(u64, Wakeup)>,
}

impl CancellationToken {
    /// Creates a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token and wakes everything waiting on it.
    pub fn cancel(&self) {
        let woken = {
            let mut waiters = self.inner.waiters.lock();
            if self.inner.cancelled.swap(true, Release) {
                return;
            }
            std::mem::take(&mut waiters.entries)
        };
        trace!(waiters = woken.len(), "cancellation token cancelled");
        for (_, wakeup) in woken {
            wakeup.wake();
        }
    }

    /// Returns whether [`cancel`](Self::cancel) has been called on this token or a clone.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Acquire)
    }

    /// Returns a future that completes once the token is cancelled.
    pub fn cancelled(&self) -> Cancelled<'_> {
        Cancelled {
            token: self,
            key: None,
        }
    }

    /// Registers a wakeup to be notified on cancellation.
    ///
    /// If `key` is given, the registration with that key is replaced. The wakeup is
    /// invoked immediately if the token is already cancelled.
    fn register(&self, key: Option<u64>, wakeup: Wakeup) -> u64 {
        let mut waiters = self.inner.waiters.lock();
        if self.is_cancelled() {
            drop(waiters);
            wakeup.wake();
            return key.unwrap_or(0);
        }
        if let Some(key) = key {
            if let Some(entry) = waiters.entries.iter_mut().find(|(k, _)| *k == key) {
                entry.1 = wakeup;
                return key;
            }
        }
        waiters.next_key += 1;
        let key = waiters.next_key;
        waiters.entries.push((key, wakeup));
        key
    }

    fn deregister(&self, key: u64) {
        self.inner.waiters.lock().entries.retain(|(k, _)| *k != key);
    }

    /// Registers the current thread to be unparked on cancellation.
    ///
    /// The registration is removed when the returned value is dropped.
    pub(crate) fn register_thread(&self) -> Registration<'_> {
        Registration {
            token: self,
            key: self.register(None, Wakeup::current_thread()),
        }
    }
}

impl Debug for CancellationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

pub(crate) struct Registration<'a> {
    token: &'a CancellationToken,
    key: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.token.deregister(self.key);
    }
}

/// Future returned by [`CancellationToken::cancelled`].
#[must_use = "futures do nothing unless polled"]
pub struct Cancelled<'a> {
    token: &'a CancellationToken,
    key: Option<u64>,
}

impl Future for Cancelled<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            return Poll::Ready(());
        }
        this.key = Some(
            this.token
                .register(this.key, Wakeup::Task(cx.waker().clone())),
        );
        if this.token.is_cancelled() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Cancelled<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.token.deregister(key);
        }
    }
}

impl Debug for Cancelled<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancelled")
            .field("token", self.token)
            .finish_non_exhaustive()
    }
}
