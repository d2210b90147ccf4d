//! A fair counting semaphore usable from threads and from futures.
//!
//! Waiters are served strictly in arrival order. A waiter at the front of the queue
//! blocks everyone behind it, even if the waiters behind it ask for fewer permits. This
//! is what keeps writers from starving in [`ReentrantRwLock`](crate::ReentrantRwLock).

use {
    crate::{cancel::CancellationToken, error::LockError, wakeup::Wakeup},
    futures::future::{self, Either},
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
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
        thread,
    },
    tracing::trace,
};


pub(crate) struct Semaphore {
    state: Mutex<State>,
}

struct State {
    available: u32,
    waiters: VecDeque<Arc<Waiter>>,
}

struct Waiter {
    units: u32,
    // Only ever set while holding the semaphore state lock.
    granted: AtomicBool,
    wakeup: Mutex<Option<Wakeup>>,
}

impl State {
    /// Hands permits to waiters at the front of the queue.
    ///
    /// Returns the wakeups of all waiters that were granted. They must be invoked after
    /// the state lock has been released.
    fn grant(&mut self) -> Vec<Wakeup> {
        let mut woken = Vec::new();
        while self
            .waiters
            .front()
            .is_some_and(|waiter| waiter.units <= self.available)
        {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.available -= waiter.units;
            waiter.granted.store(true, Release);
            woken.extend(waiter.wakeup.lock().take());
        }
        woken
    }
}

impl Semaphore {
    pub(crate) fn new(permits: u32) -> Self {
        Self {
            state: Mutex::new(State {
                available: permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub(crate) fn available(&self) -> u32 {
        self.state.lock().available
    }

    #[cfg(test)]
    pub(crate) fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Takes `units` permits if that can be done without overtaking a waiter.
    pub(crate) fn try_acquire(&self, units: u32) -> bool {
        let mut state = self.state.lock();
        if state.waiters.is_empty() && state.available >= units {
            state.available -= units;
            true
        } else {
            false
        }
    }

    /// Returns `units` permits and wakes the waiters that can now proceed.
    pub(crate) fn release(&self, units: u32) {
        let woken = {
            let mut state = self.state.lock();
            state.available += units;
            state.grant()
        };
        for wakeup in woken {
            wakeup.wake();
        }
    }

    /// Takes `units` permits immediately or joins the queue.
    ///
    /// Returns `None` if the permits were taken.
    fn enqueue(&self, units: u32, wakeup: impl FnOnce() -> Wakeup) -> Option<Arc<Waiter>> {
        let mut state = self.state.lock();
        if state.waiters.is_empty() && state.available >= units {
            state.available -= units;
            return None;
        }
        let waiter = Arc::new(Waiter {
            units,
            granted: AtomicBool::new(false),
            wakeup: Mutex::new(Some(wakeup())),
        });
        state.waiters.push_back(waiter.clone());
        trace!(units, queued = state.waiters.len(), "waiting for permits");
        Some(waiter)
    }

    /// Leaves the queue.
    ///
    /// Returns whether the waiter had already been granted its permits. In that case the
    /// caller owns the permits.
    fn withdraw(&self, waiter: &Arc<Waiter>) -> bool {
        let woken = {
            let mut state = self.state.lock();
            if waiter.granted.load(Acquire) {
                return true;
            }
            state.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
            // Removing the front waiter can unblock the waiters behind it.
            state.grant()
        };
        for wakeup in woken {
            wakeup.wake();
        }
        false
    }

    /// Blocks the current thread until `units` permits have been taken.
    pub(crate) fn acquire_blocking(&self, units: u32) {
        let acquired = self.block_until_granted(units, None);
        debug_assert!(acquired);
    }

    /// Blocks the current thread until `units` permits have been taken or `token` is
    /// cancelled.
    pub(crate) fn acquire_blocking_cancellable(
        &self,
        units: u32,
        token: &CancellationToken,
    ) -> Result<(), LockError> {
        if self.block_until_granted(units, Some(token)) {
            Ok(())
        } else {
            Err(LockError::Cancelled)
        }
    }

    fn block_until_granted(&self, units: u32, token: Option<&CancellationToken>) -> bool {
        let Some(waiter) = self.enqueue(units, Wakeup::current_thread) else {
            return true;
        };
        let _registration = token.map(|token| token.register_thread());
        loop {
            if waiter.granted.load(Acquire) {
                return true;
            }
            if token.is_some_and(|token| token.is_cancelled()) {
                let granted = self.withdraw(&waiter);
                if !granted {
                    trace!(units, "blocking acquisition cancelled");
                }
                return granted;
            }
            thread::park();
        }
    }

    /// Waits until `units` permits have been taken.
    ///
    /// Dropping the returned future before it completes leaves the queue. Permits that
    /// were granted to it in the meantime are handed on.
    pub(crate) fn acquire(&self, units: u32) -> Acquisition<'_> {
        Acquisition {
            semaphore: self,
            units,
            waiter: None,
            done: false,
        }
    }

    /// Waits until `units` permits have been taken or `token` is cancelled.
    pub(crate) async fn acquire_cancellable(
        &self,
        units: u32,
        token: &CancellationToken,
    ) -> Result<(), LockError> {
        // `select` polls the acquisition first, so an uncontended call succeeds even if
        // the token is already cancelled.
        match future::select(self.acquire(units), token.cancelled()).await {
            Either::Left(((), _)) => Ok(()),
            Either::Right(((), mut acquire)) => {
                if acquire.finish_if_granted() {
                    Ok(())
                } else {
                    trace!(units, "asynchronous acquisition cancelled");
                    Err(LockError::Cancelled)
                }
            }
        }
    }
}

/// Future returned by [`Semaphore::acquire`].
#[must_use = "futures do nothing unless polled"]
pub(crate) struct Acquisition<'a> {
    semaphore: &'a Semaphore,
    units: u32,
    waiter: Option<Arc<Waiter>>,
    done: bool,
}

impl Acquisition<'_> {
    fn finish_if_granted(&mut self) -> bool {
        if self.done {
            return true;
        }
        if let Some(waiter) = &self.waiter {
            if waiter.granted.load(Acquire) {
                self.done = true;
            }
        }
        self.done
    }
}

impl Future for Acquisition<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.finish_if_granted() {
            return Poll::Ready(());
        }
        match &this.waiter {
            None => {
                match this
                    .semaphore
                    .enqueue(this.units, || Wakeup::Task(cx.waker().clone()))
                {
                    None => {
                        this.done = true;
                        Poll::Ready(())
                    }
                    Some(waiter) => {
                        this.waiter = Some(waiter);
                        Poll::Pending
                    }
                }
            }
            Some(waiter) => {
                *waiter.wakeup.lock() = Some(Wakeup::Task(cx.waker().clone()));
                // The permits may have been granted before the new waker was stored.
                if this.finish_if_granted() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for Acquisition<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(waiter) = self.waiter.take() {
            if self.semaphore.withdraw(&waiter) {
                self.semaphore.release(self.units);
            }
        }
    }
}
