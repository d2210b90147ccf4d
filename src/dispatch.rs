//! A dispatch context that runs callbacks one at a time on a dedicated thread.
//!
//! Code that must run "in the right place" captures a [`ContextHandle`] and marshals
//! callbacks onto it with [`ContextHandle::post`] (fire and forget) or
//! [`ContextHandle::send`] (wait for the result). While a callback runs, its context is
//! the ambient context of the worker thread, so [`current`] returns it and nested
//! posts and sends from inside the callback route through the same context.
//!
//! There are two ways to get a context:
//!
//! - [`SingleThreadedContext`] owns its worker. Dropping it, or calling
//!   [`SingleThreadedContext::shutdown`], stops the worker.
//! - [`default_context`] returns a handle to a process-wide context. A handle has no way
//!   to shut the context down, so no caller can stop the shared worker by accident.
//!
//! # Example
//!
//! ```
//! use flowlock::{SingleThreadedContext, dispatch};
//!
//! let context = SingleThreadedContext::new().unwrap();
//! let on_worker = context
//!     .send(|| dispatch::current().is_some())
//!     .unwrap();
//! assert!(on_worker);
//! assert!(dispatch::current().is_none());
//! ```

use {
    crate::{error::DispatchError, flow::Flow},
    futures::channel::oneshot,
    parking_lot::{Condvar, Mutex},
    queue::{Job, JobQueue},
    run_on_drop::on_drop,
    static_assertions::assert_impl_all,
    std::{
        any::Any,
        cell::RefCell,
        fmt::{Debug, Formatter},
        io,
        ops::Deref,
        panic::{self, AssertUnwindSafe},
        sync::{Arc, OnceLock},
        thread::{self, JoinHandle},
    },
    tracing::{debug, warn},
};

mod queue;

const DEFAULT_WORKER_NAME: &str = "flowlock-dispatch";
const DEFAULT_CONTEXT_NAME: &str = "flowlock-default";

thread_local! {
    static CURRENT: RefCell<Option<ContextHandle>> = const { RefCell::new(None) };
}

/// Returns the dispatch context whose callback is running on this thread, if any.
pub fn current() -> Option<ContextHandle> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Returns the ambient dispatch context, falling back to the process-wide default.
///
/// This is what code that raises events should capture when the caller did not supply a
/// context.
pub fn current_or_default() -> Result<ContextHandle, DispatchError> {
    match current() {
        Some(handle) => Ok(handle),
        None => default_context().cloned(),
    }
}

/// Returns the process-wide default context.
///
/// The context is started on first use and runs until the process exits.
///
/// # Example
///
/// ```
/// use flowlock::dispatch;
///
/// let context = dispatch::default_context().unwrap();
/// assert_eq!(context.name(), "flowlock-default");
/// assert_eq!(context.send(|| 1 + 1).unwrap(), 2);
/// ```
pub fn default_context() -> Result<&'static ContextHandle, DispatchError> {
    static DEFAULT: OnceLock<ContextHandle> = OnceLock::new();
    if let Some(handle) = DEFAULT.get() {
        return Ok(handle);
    }
    let handle = DispatchBuilder::new()
        .name(DEFAULT_CONTEXT_NAME)
        .build()?
        .detach();
    let winner = DEFAULT.get_or_init(|| handle.clone());
    if *winner != handle {
        // Another thread started the default context first.
        drop(handle.shared.queue.shut_down());
    }
    Ok(winner)
}

/// Runs `f` with `handle` as the ambient context of this thread.
fn enter<R>(handle: &ContextHandle, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT.with(|current| current.replace(Some(handle.clone())));
    let _restore = on_drop(move || {
        CURRENT.with(|current| current.replace(previous));
    });
    f()
}

/// Configures a [`SingleThreadedContext`].
///
/// # Example
///
/// ```
/// use flowlock::DispatchBuilder;
///
/// let context = DispatchBuilder::new()
///     .name("events")
///     .stack_size(256 * 1024)
///     .build()
///     .unwrap();
/// let name = context.send(|| std::thread::current().name().map(str::to_owned));
/// assert_eq!(name.unwrap().as_deref(), Some("events"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct DispatchBuilder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl DispatchBuilder {
    /// Creates a builder with the default worker name and stack size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name of the context and of its worker thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the stack size of the worker thread.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Starts the worker thread.
    ///
    /// Fails with [`DispatchError::Spawn`] if the name contains a nul byte or the
    /// thread cannot be created.
    pub fn build(self) -> Result<SingleThreadedContext, DispatchError> {
        let name = self
            .name
            .unwrap_or_else(|| DEFAULT_WORKER_NAME.to_owned());
        if name.contains('\0') {
            return Err(DispatchError::Spawn(io::Error::new(
                io::ErrorKind::InvalidInput,
                "thread name contains a nul byte",
            )));
        }
        let handle = ContextHandle {
            shared: Arc::new(Shared {
                name: name.clone(),
                queue: JobQueue::new(),
            }),
        };
        let mut builder = thread::Builder::new().name(name);
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let worker_handle = handle.clone();
        let worker = builder
            .spawn(move || run_worker(worker_handle))
            .map_err(DispatchError::Spawn)?;
        Ok(SingleThreadedContext {
            handle,
            worker: Some(worker),
        })
    }
}

fn run_worker(handle: ContextHandle) {
    debug!(context = handle.name(), "dispatch worker started");
    while let Some(job) = handle.shared.queue.pop() {
        enter(&handle, || {
            // Callbacks never inherit locks from the code that queued them.
            Flow::empty().run(|| {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    warn!(
                        context = handle.name(),
                        panic = panic_message(&*payload),
                        "posted callback panicked"
                    );
                }
            })
        });
    }
    debug!(context = handle.name(), "dispatch worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// A dispatch context with its own worker thread.
///
/// The context stops accepting callbacks when it is shut down or dropped. The callback
/// that is running at that moment completes; callbacks still queued are discarded and
/// their senders receive [`DispatchError::ShutDown`].
///
/// This type derefs to its [`ContextHandle`].
pub struct SingleThreadedContext {
    handle: ContextHandle,
    worker: Option<JoinHandle<()>>,
}

impl SingleThreadedContext {
    /// Starts a context with the default configuration.
    pub fn new() -> Result<Self, DispatchError> {
        DispatchBuilder::new().build()
    }

    /// Returns a cloneable handle that can post to this context but not shut it down.
    pub fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    /// Stops the context and waits for its worker thread to exit.
    ///
    /// If this is called from a callback running on the context itself, the worker exits
    /// once that callback returns.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let abandoned = self.handle.shared.queue.shut_down();
        debug!(
            context = self.handle.name(),
            abandoned = abandoned.len(),
            "dispatch context shutting down"
        );
        drop(abandoned);
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            warn!(context = self.handle.name(), "dispatch worker panicked");
        }
    }

    /// Lets the worker run for the rest of the process.
    fn detach(mut self) -> ContextHandle {
        self.worker = None;
        self.handle.clone()
    }
}

impl Deref for SingleThreadedContext {
    type Target = ContextHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for SingleThreadedContext {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Debug for SingleThreadedContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleThreadedContext")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// A handle to a dispatch context.
///
/// Handles are cheap to clone and can be sent to other threads.
#[derive(Clone)]
pub struct ContextHandle {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    queue: JobQueue,
}

assert_impl_all!(ContextHandle: Send, Sync);
assert_impl_all!(SingleThreadedContext: Send, Sync);

impl ContextHandle {
    /// Returns the name of the context, which is also the name of its worker thread.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns whether a callback of this context is running on the current thread.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| current.borrow().as_ref() == Some(self))
    }

    /// Returns whether the context has stopped accepting callbacks.
    pub fn is_shut_down(&self) -> bool {
        self.shared.queue.is_shut_down()
    }

    /// Queues `f` and returns without waiting for it to run.
    ///
    /// Callbacks posted from one thread run in the order in which they were posted. A
    /// panic in `f` is logged and otherwise ignored.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::mpsc;
    /// use flowlock::SingleThreadedContext;
    ///
    /// let context = SingleThreadedContext::new().unwrap();
    /// let (tx, rx) = mpsc::channel();
    /// for i in 0..3 {
    ///     let tx = tx.clone();
    ///     context.post(move || tx.send(i).unwrap()).unwrap();
    /// }
    /// assert_eq!(rx.iter().take(3).collect::<Vec<_>>(), [0, 1, 2]);
    /// ```
    pub fn post<F>(&self, f: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Box::new(f))
    }

    /// Runs `f` on this context and waits for its result.
    ///
    /// If `f` panics, the panic is resumed on the calling thread with the original
    /// payload. When called from a callback that is already running on this context,
    /// `f` runs inline, since queueing it would wait on itself.
    ///
    /// # Example
    ///
    /// ```
    /// use std::panic::{self, AssertUnwindSafe};
    /// use flowlock::SingleThreadedContext;
    ///
    /// let context = SingleThreadedContext::new().unwrap();
    /// assert_eq!(context.send(|| 6 * 7).unwrap(), 42);
    ///
    /// let panic = panic::catch_unwind(AssertUnwindSafe(|| context.send(|| -> u32 { panic!("boom") })));
    /// assert_eq!(*panic.unwrap_err().downcast::<&str>().unwrap(), "boom");
    /// ```
    pub fn send<T, F>(&self, f: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }
        let completion = Arc::new(Completion::default());
        let completer = Completer {
            completion: Some(completion.clone()),
        };
        self.push(Box::new(move || {
            completer.finish(panic::catch_unwind(AssertUnwindSafe(f)));
        }))?;
        match completion.wait() {
            Outcome::Finished(Ok(value)) => Ok(value),
            Outcome::Finished(Err(payload)) => panic::resume_unwind(payload),
            Outcome::Abandoned => Err(DispatchError::ShutDown),
        }
    }

    /// Runs `f` on this context and resolves to its result without blocking a thread.
    ///
    /// A panic in `f` is resumed when the returned future is polled. Awaiting this from
    /// a callback of the same context never completes, since the context cannot run `f`
    /// until the awaiting callback returns.
    pub async fn send_async<T, F>(&self, f: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.push(Box::new(move || {
            let _ = tx.send(panic::catch_unwind(AssertUnwindSafe(f)));
        }))?;
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(oneshot::Canceled) => Err(DispatchError::ShutDown),
        }
    }

    fn push(&self, job: Job) -> Result<(), DispatchError> {
        self.shared
            .queue
            .push(job)
            .map_err(|_| DispatchError::ShutDown)
    }
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for ContextHandle {}

impl Debug for ContextHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("name", &self.shared.name)
            .field("queued", &self.shared.queue.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

enum Outcome<T> {
    Finished(thread::Result<T>),
    Abandoned,
}

/// The slot through which a sent callback reports back to its sender.
struct Completion<T> {
    outcome: Mutex<Option<Outcome<T>>>,
    done: Condvar,
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }
}

impl<T> Completion<T> {
    fn complete(&self, outcome: Outcome<T>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_one();
    }

    fn wait(&self) -> Outcome<T> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(outcome) = outcome.take() {
                return outcome;
            }
            self.done.wait(&mut outcome);
        }
    }
}

/// Completes a [`Completion`] exactly once, marking it abandoned if the callback is
/// dropped without running.
struct Completer<T> {
    completion: Option<Arc<Completion<T>>>,
}

impl<T> Completer<T> {
    fn finish(mut self, result: thread::Result<T>) {
        if let Some(completion) = self.completion.take() {
            completion.complete(Outcome::Finished(result));
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.complete(Outcome::Abandoned);
        }
    }
}
