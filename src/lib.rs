//! This crate provides re-entrant locks whose holders are logical flows, and a
//! single-threaded dispatch context to marshal callbacks onto.
//!
//! # Motivation
//!
//! A re-entrant mutex usually identifies its holder by thread. That breaks down in
//! asynchronous code: a future that holds a lock can be resumed on another thread, and
//! two unrelated futures can be polled on the same thread. The locks in this crate
//! instead identify their holder by [`Flow`]. A flow is a thread running synchronous
//! code, or a future together with every future it creates and awaits.
//!
//! ```
//! use futures::executor::block_on;
//! use flowlock::ReentrantMutex;
//!
//! let mutex = ReentrantMutex::default();
//!
//! async fn helper(mutex: &ReentrantMutex) -> u32 {
//!     // Re-enters the lock held by the caller instead of deadlocking.
//!     mutex.with_lock_async(|| async { 1 }).await
//! }
//!
//! let n = block_on(mutex.with_lock_async(|| async { helper(&mutex).await + 1 }));
//! assert_eq!(n, 2);
//! ```
//!
//! # Locks
//!
//! - [`ReentrantMutex`] provides mutual exclusion.
//! - [`ReentrantRwLock`] provides shared reader access and exclusive writer access. A
//!   flow that holds a read lock cannot upgrade it to a write lock; the attempt fails
//!   with [`LockError::Escalation`] instead of deadlocking.
//!
//! Both come with blocking, cancellable blocking, and asynchronous entry points. Each
//! entry point takes a closure and runs it while holding the lock. A call that re-enters
//! a lock its flow already holds never waits and never observes cancellation. Only the
//! call that acquired a lock releases it, on every exit path.
//!
//! # Dispatch
//!
//! [`SingleThreadedContext`] runs callbacks one at a time, in submission order, on a
//! dedicated thread. The [`dispatch`] module exposes the ambient context and a
//! process-wide default for code that needs a context when its caller did not supply
//! one.

pub use {
    cancel::{CancellationToken, Cancelled},
    dispatch::{ContextHandle, DispatchBuilder, SingleThreadedContext},
    error::{DispatchError, LockError},
    flow::{Flow, FlowScoped},
    mutex::ReentrantMutex,
    rwlock::{MAX_READERS, ReentrantRwLock, Role},
};

mod cancel;
pub mod dispatch;
mod error;
mod flow;
mod mutex;
mod rwlock;
mod semaphore;
mod wakeup;
#[cfg(test)]
mod test_util;
