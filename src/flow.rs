//! Ambient lock state that follows a logical flow of execution.
//!
//! A flow is either a thread running synchronous code, or a future together with the
//! futures it creates. Each flow carries an immutable chain of the locks it holds. On a
//! plain thread the chain lives in thread-local storage. A [`FlowScoped`] future captures
//! a chain and re-installs it around every poll, so the chain follows the asynchronous
//! continuations of the call that created it rather than the thread that happens to poll
//! it.

use {
    debug_fn::debug_fn,
    run_on_drop::on_drop,
    std::{
        cell::RefCell,
        fmt::{Debug, Formatter},
        future::Future,
        iter,
        pin::Pin,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering::Relaxed},
        },
        task::{Context, Poll},
    },
};

#[cfg(test)]
mod tests;

/// Identifies one lock for the lifetime of the process.
///
/// IDs are never reused, so a stale entry for a dropped lock can never be mistaken for
/// an entry of a new lock that happens to live at the same address.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct LockId(u64);

impl LockId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Relaxed))
    }
}

/// How a flow holds a lock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Hold {
    Exclusive,
    Reader,
    Writer,
}

struct Frame {
    lock: LockId,
    hold: Hold,
    parent: Option<Arc<Frame>>,
}

/// A snapshot of the locks held by a flow.
///
/// Cloning a [`Flow`] is about as expensive as cloning an [`Arc`]. The snapshot is
/// immutable: acquiring a lock produces a new snapshot that is installed for the
/// duration of the protected region.
///
/// # Example
///
/// ```
/// use flowlock::{Flow, ReentrantMutex};
///
/// let mutex = ReentrantMutex::default();
/// mutex.with_lock(|| {
///     let flow = Flow::capture();
///     // A different thread running in the captured flow is treated as the same holder.
///     std::thread::scope(|s| {
///         s.spawn(|| flow.run(|| assert!(mutex.is_held_by_current_flow())));
///     });
/// });
/// ```
#[derive(Clone, Default)]
pub struct Flow {
    head: Option<Arc<Frame>>,
}

thread_local! {
    static CURRENT: RefCell<Flow> = const { RefCell::new(Flow { head: None }) };
}

impl Flow {
    /// Returns an empty flow that holds no locks.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Captures the flow of the calling code.
    pub fn capture() -> Self {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Returns whether this flow holds no locks.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Runs `f` with this flow installed as the ambient flow.
    ///
    /// The previous flow is restored when `f` returns or unwinds. Holds added inside
    /// `f` end with it.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = install(self.clone());
        let _restore = on_drop(move || {
            install(previous);
        });
        f()
    }

    /// Wraps a future so that it is always polled inside this flow.
    ///
    /// Futures handed to an executor start a new flow. Use this to make a spawned
    /// future part of the flow that spawned it.
    pub fn scope<F>(self, future: F) -> FlowScoped<F>
    where
        F: Future,
    {
        FlowScoped {
            flow: self,
            future: Box::pin(future),
        }
    }

    /// Creates a future inside this flow and then scopes it to this flow.
    pub(crate) fn scoped<F, Fut>(self, f: F) -> FlowScoped<Fut>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let future = self.run(f);
        self.scope(future)
    }

    pub(crate) fn hold(&self, lock: LockId) -> Option<Hold> {
        self.frames()
            .find(|frame| frame.lock == lock)
            .map(|frame| frame.hold)
    }

    pub(crate) fn with_hold(&self, lock: LockId, hold: Hold) -> Self {
        Self {
            head: Some(Arc::new(Frame {
                lock,
                hold,
                parent: self.head.clone(),
            })),
        }
    }

    fn frames(&self) -> impl Iterator<Item = &Frame> {
        iter::successors(self.head.as_deref(), |frame| frame.parent.as_deref())
    }
}

impl Debug for Flow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field(
                "holds",
                &debug_fn(|fmt| {
                    fmt.debug_list()
                        .entries(self.frames().map(|frame| (frame.lock.0, frame.hold)))
                        .finish()
                }),
            )
            .finish()
    }
}

/// Returns how the current flow holds `lock`, if at all.
pub(crate) fn current_hold(lock: LockId) -> Option<Hold> {
    CURRENT.with(|current| current.borrow().hold(lock))
}

/// Replaces the ambient flow of this thread and returns the previous one.
fn install(flow: Flow) -> Flow {
    CURRENT.with(|current| current.replace(flow))
}

/// A future that is polled inside a captured [`Flow`].
///
/// Created by [`Flow::scope`].
pub struct FlowScoped<F> {
    flow: Flow,
    future: Pin<Box<F>>,
}

impl<F> Future for FlowScoped<F>
where
    F: Future,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let future = &mut this.future;
        this.flow.run(|| future.as_mut().poll(cx))
    }
}

impl<F> Debug for FlowScoped<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowScoped")
            .field("flow", &self.flow)
            .finish_non_exhaustive()
    }
}
