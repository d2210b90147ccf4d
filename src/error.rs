use {std::io, thiserror::Error};

/// Error returned by the fallible lock entry points.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The [`CancellationToken`](crate::CancellationToken) was cancelled while the call
    /// was waiting to acquire the lock.
    #[error("lock acquisition was cancelled")]
    Cancelled,
    /// The current flow holds a reader lock and asked for a writer lock.
    ///
    /// Upgrading a reader to a writer would wait for all readers to drain, including
    /// the flow itself, so the request is rejected instead.
    #[error("cannot acquire a writer lock while holding a reader lock")]
    Escalation,
}

/// Error returned by the dispatch context entry points.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The context no longer accepts work, or was shut down before running the callback.
    #[error("dispatch context has been shut down")]
    ShutDown,
    /// The worker thread could not be started.
    #[error("failed to spawn dispatch worker: {0}")]
    Spawn(#[source] io::Error),
}
