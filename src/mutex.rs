use {
    crate::{
        cancel::CancellationToken,
        error::LockError,
        flow::{self, Flow, Hold, LockId},
        semaphore::Semaphore,
    },
    run_on_drop::on_drop,
    static_assertions::assert_impl_all,
    std::{
        fmt::{Debug, Formatter},
        future::Future,
        sync::Arc,
    },
};

#[cfg(test)]
mod tests;

/// A re-entrant mutual-exclusion lock whose holder is a flow rather than a thread.
///
/// The first call on a flow acquires the lock. Calls nested inside it, including calls
/// made from futures awaited inside an asynchronous protected region, see that the flow
/// already holds the lock and run without contending. Only the call that acquired the
/// lock releases it.
///
/// Cloning the mutex produces another handle to the same lock.
///
/// # Example
///
/// ```
/// use flowlock::ReentrantMutex;
///
/// let mutex = ReentrantMutex::default();
/// let value = mutex.with_lock(|| {
///     // Re-entering on the same flow does not deadlock.
///     mutex.with_lock(|| 42)
/// });
/// assert_eq!(value, 42);
/// assert!(!mutex.is_locked());
/// ```
#[derive(Clone, Default)]
pub struct ReentrantMutex {
    shared: Arc<Shared>,
}

struct Shared {
    id: LockId,
    // One permit. The flow that took it is recorded in its own ambient state only.
    gate: Semaphore,
}

assert_impl_all!(ReentrantMutex: Send, Sync);

impl Default for Shared {
    fn default() -> Self {
        Self {
            id: LockId::next(),
            gate: Semaphore::new(1),
        }
    }
}

impl ReentrantMutex {
    /// Returns whether any flow holds this lock.
    ///
    /// # Example
    ///
    /// ```
    /// use flowlock::ReentrantMutex;
    ///
    /// let mutex = ReentrantMutex::default();
    /// assert!(!mutex.is_locked());
    /// mutex.with_lock(|| assert!(mutex.is_locked()));
    /// ```
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.shared.gate.available() == 0
    }

    /// Returns whether the current flow holds this lock.
    ///
    /// # Example
    ///
    /// ```
    /// use std::thread;
    /// use flowlock::ReentrantMutex;
    ///
    /// let mutex = ReentrantMutex::default();
    /// mutex.with_lock(|| {
    ///     assert!(mutex.is_held_by_current_flow());
    ///     thread::scope(|s| {
    ///         s.spawn(|| assert!(!mutex.is_held_by_current_flow()));
    ///     });
    /// });
    /// ```
    #[inline]
    pub fn is_held_by_current_flow(&self) -> bool {
        flow::current_hold(self.shared.id).is_some()
    }

    /// Runs `f` while holding this lock.
    ///
    /// If the current flow already holds the lock, `f` runs immediately. Otherwise the
    /// current thread blocks until the lock is free. The lock is released when `f`
    /// returns or unwinds.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::atomic::{AtomicU32, Ordering::Relaxed};
    /// use std::thread;
    /// use flowlock::ReentrantMutex;
    ///
    /// let mutex = ReentrantMutex::default();
    /// let counter = AtomicU32::new(0);
    /// thread::scope(|s| {
    ///     for _ in 0..4 {
    ///         s.spawn(|| {
    ///             mutex.with_lock(|| {
    ///                 let n = counter.load(Relaxed);
    ///                 counter.store(n + 1, Relaxed);
    ///             });
    ///         });
    ///     }
    /// });
    /// assert_eq!(counter.load(Relaxed), 4);
    /// ```
    pub fn with_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        if self.is_held_by_current_flow() {
            return f();
        }
        self.shared.gate.acquire_blocking(1);
        self.run_held(f)
    }

    /// Runs `f` while holding this lock, giving up if `token` is cancelled first.
    ///
    /// The token is only consulted while the current thread is waiting for another flow
    /// to release the lock. A re-entrant call never fails.
    pub fn with_lock_cancellable<T>(
        &self,
        token: &CancellationToken,
        f: impl FnOnce() -> T,
    ) -> Result<T, LockError> {
        if self.is_held_by_current_flow() {
            return Ok(f());
        }
        self.shared.gate.acquire_blocking_cancellable(1, token)?;
        Ok(self.run_held(f))
    }

    /// Runs `f` while holding this lock if the lock can be acquired without blocking.
    ///
    /// # Example
    ///
    /// ```
    /// use std::thread;
    /// use flowlock::ReentrantMutex;
    ///
    /// let mutex = ReentrantMutex::default();
    /// mutex.with_lock(|| {
    ///     assert_eq!(mutex.try_with_lock(|| 1), Some(1));
    ///     thread::scope(|s| {
    ///         s.spawn(|| assert_eq!(mutex.try_with_lock(|| 1), None));
    ///     });
    /// });
    /// ```
    pub fn try_with_lock<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        if self.is_held_by_current_flow() {
            return Some(f());
        }
        self.shared
            .gate
            .try_acquire(1)
            .then(|| self.run_held(f))
    }

    fn run_held<T>(&self, f: impl FnOnce() -> T) -> T {
        let _release = on_drop(|| self.shared.gate.release(1));
        Flow::capture()
            .with_hold(self.shared.id, Hold::Exclusive)
            .run(f)
    }

    /// Runs the future returned by `f` while holding this lock.
    ///
    /// If the current flow already holds the lock, the future runs immediately.
    /// Otherwise this suspends until the lock is free. The future created by `f`, and
    /// every future it awaits, belongs to the acquiring flow and re-enters the lock
    /// without contending.
    ///
    /// The lock is released when the future completes, unwinds, or is dropped.
    ///
    /// # Example
    ///
    /// ```
    /// use futures::executor::block_on;
    /// use flowlock::ReentrantMutex;
    ///
    /// let mutex = ReentrantMutex::default();
    /// let value = block_on(mutex.with_lock_async(|| async {
    ///     mutex.with_lock_async(|| async { 7 }).await
    /// }));
    /// assert_eq!(value, 7);
    /// ```
    pub async fn with_lock_async<F, Fut>(&self, f: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        if self.is_held_by_current_flow() {
            return f().await;
        }
        self.shared.gate.acquire(1).await;
        self.run_held_async(f).await
    }

    /// Like [`with_lock_async`](Self::with_lock_async) but gives up if `token` is
    /// cancelled while waiting for the lock.
    pub async fn with_lock_async_cancellable<F, Fut>(
        &self,
        token: &CancellationToken,
        f: F,
    ) -> Result<Fut::Output, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        if self.is_held_by_current_flow() {
            return Ok(f().await);
        }
        self.shared.gate.acquire_cancellable(1, token).await?;
        Ok(self.run_held_async(f).await)
    }

    async fn run_held_async<F, Fut>(&self, f: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let _release = on_drop(|| self.shared.gate.release(1));
        Flow::capture()
            .with_hold(self.shared.id, Hold::Exclusive)
            .scoped(f)
            .await
    }
}

impl Debug for ReentrantMutex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReentrantMutex")
            .field("id", &self.shared.id)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

impl PartialEq for ReentrantMutex {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for ReentrantMutex {}
