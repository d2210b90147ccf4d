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


/// The maximum number of flows that can hold a [`ReentrantRwLock`] as readers at once.
///
/// A writer takes all of these permits.
pub const MAX_READERS: u32 = u32::MAX >> 3;

/// The role in which a flow holds a [`ReentrantRwLock`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    /// Shared access. Any number of flows can be readers at the same time.
    Reader,
    /// Exclusive access.
    Writer,
}

impl Role {
    fn permits(self) -> u32 {
        match self {
            Role::Reader => 1,
            Role::Writer => MAX_READERS,
        }
    }

    fn hold(self) -> Hold {
        match self {
            Role::Reader => Hold::Reader,
            Role::Writer => Hold::Writer,
        }
    }
}

/// A re-entrant reader/writer lock whose holders are flows.
///
/// - A flow that holds nothing acquires the lock in the requested role.
/// - A flow that holds the lock in any role can take a read lock again without
///   contending.
/// - A flow that holds a write lock can take a write lock again without contending.
/// - A flow that holds a read lock and asks for a write lock fails immediately with
///   [`LockError::Escalation`]. Waiting would deadlock, since the writer would wait for
///   its own read lock to be released.
///
/// Acquisition is fair: a waiting writer blocks readers that arrive after it.
///
/// # Example
///
/// ```
/// use flowlock::{LockError, ReentrantRwLock};
///
/// let lock = ReentrantRwLock::default();
///
/// lock.with_write_lock(|| {
///     // Reading under a write lock re-enters it.
///     lock.with_read_lock(|| ());
/// })
/// .unwrap();
///
/// lock.with_read_lock(|| {
///     assert_eq!(lock.with_write_lock(|| ()), Err(LockError::Escalation));
/// });
/// ```
#[derive(Clone, Default)]
pub struct ReentrantRwLock {
    shared: Arc<Shared>,
}

struct Shared {
    id: LockId,
    permits: Semaphore,
}

assert_impl_all!(ReentrantRwLock: Send, Sync);

impl Default for Shared {
    fn default() -> Self {
        Self {
            id: LockId::next(),
            permits: Semaphore::new(MAX_READERS),
        }
    }
}

/// What a call has to do before running its protected region.
enum Entry {
    /// The flow already holds the lock in a compatible role.
    Nested,
    /// The flow holds nothing and must acquire the lock.
    Acquire,
}

impl ReentrantRwLock {
    /// Returns the role in which the current flow holds this lock.
    ///
    /// # Example
    ///
    /// ```
    /// use flowlock::{ReentrantRwLock, Role};
    ///
    /// let lock = ReentrantRwLock::default();
    /// assert_eq!(lock.held_role(), None);
    /// lock.with_read_lock(|| assert_eq!(lock.held_role(), Some(Role::Reader)));
    /// ```
    pub fn held_role(&self) -> Option<Role> {
        match flow::current_hold(self.shared.id)? {
            Hold::Reader => Some(Role::Reader),
            Hold::Writer => Some(Role::Writer),
            Hold::Exclusive => None,
        }
    }

    /// Returns whether some flow holds this lock as a writer.
    pub fn is_write_locked(&self) -> bool {
        self.shared.permits.available() == 0
    }

    /// Returns the number of flows that hold this lock as readers.
    pub fn reader_count(&self) -> u32 {
        match self.shared.permits.available() {
            0 => 0,
            available => MAX_READERS - available,
        }
    }

    fn entry(&self, role: Role) -> Result<Entry, LockError> {
        match (self.held_role(), role) {
            (None, _) => Ok(Entry::Acquire),
            (Some(Role::Reader), Role::Writer) => Err(LockError::Escalation),
            (Some(_), _) => Ok(Entry::Nested),
        }
    }

    /// Runs `f` while holding this lock as a reader.
    ///
    /// Blocks the current thread while a writer holds the lock or is waiting for it.
    pub fn with_read_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        if self.held_role().is_some() {
            return f();
        }
        self.shared.permits.acquire_blocking(Role::Reader.permits());
        self.run_held(Role::Reader, f)
    }

    /// Runs `f` while holding this lock as a writer.
    ///
    /// Blocks the current thread while any other flow holds the lock. Fails with
    /// [`LockError::Escalation`] if the current flow holds the lock as a reader.
    pub fn with_write_lock<T>(&self, f: impl FnOnce() -> T) -> Result<T, LockError> {
        if let Entry::Nested = self.entry(Role::Writer)? {
            return Ok(f());
        }
        self.shared
            .permits
            .acquire_blocking(Role::Writer.permits());
        Ok(self.run_held(Role::Writer, f))
    }

    /// Like [`with_read_lock`](Self::with_read_lock) but gives up if `token` is
    /// cancelled while waiting.
    pub fn with_read_lock_cancellable<T>(
        &self,
        token: &CancellationToken,
        f: impl FnOnce() -> T,
    ) -> Result<T, LockError> {
        self.with_role_cancellable(Role::Reader, token, f)
    }

    /// Like [`with_write_lock`](Self::with_write_lock) but gives up if `token` is
    /// cancelled while waiting.
    pub fn with_write_lock_cancellable<T>(
        &self,
        token: &CancellationToken,
        f: impl FnOnce() -> T,
    ) -> Result<T, LockError> {
        self.with_role_cancellable(Role::Writer, token, f)
    }

    fn with_role_cancellable<T>(
        &self,
        role: Role,
        token: &CancellationToken,
        f: impl FnOnce() -> T,
    ) -> Result<T, LockError> {
        if let Entry::Nested = self.entry(role)? {
            return Ok(f());
        }
        self.shared
            .permits
            .acquire_blocking_cancellable(role.permits(), token)?;
        Ok(self.run_held(role, f))
    }

    fn run_held<T>(&self, role: Role, f: impl FnOnce() -> T) -> T {
        let _release = on_drop(|| self.shared.permits.release(role.permits()));
        Flow::capture()
            .with_hold(self.shared.id, role.hold())
            .run(f)
    }

    /// Runs the future returned by `f` while holding this lock as a reader.
    ///
    /// # Example
    ///
    /// ```
    /// use futures::{executor::block_on, join};
    /// use flowlock::ReentrantRwLock;
    ///
    /// let lock = ReentrantRwLock::default();
    /// block_on(async {
    ///     // Two flows read at the same time.
    ///     let a = lock.with_read_lock_async(|| async { lock.reader_count() });
    ///     let b = lock.with_read_lock_async(|| async { lock.reader_count() });
    ///     let (a, b) = join!(a, b);
    ///     assert!(a >= 1 && b >= 1);
    /// });
    /// ```
    pub async fn with_read_lock_async<F, Fut>(&self, f: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        if self.held_role().is_some() {
            return f().await;
        }
        self.shared.permits.acquire(Role::Reader.permits()).await;
        self.run_held_async(Role::Reader, f).await
    }

    /// Runs the future returned by `f` while holding this lock as a writer.
    ///
    /// Fails with [`LockError::Escalation`] if the current flow holds the lock as a
    /// reader.
    pub async fn with_write_lock_async<F, Fut>(&self, f: F) -> Result<Fut::Output, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        if let Entry::Nested = self.entry(Role::Writer)? {
            return Ok(f().await);
        }
        self.shared.permits.acquire(Role::Writer.permits()).await;
        Ok(self.run_held_async(Role::Writer, f).await)
    }

    /// Like [`with_read_lock_async`](Self::with_read_lock_async) but gives up if `token`
    /// is cancelled while waiting.
    pub async fn with_read_lock_async_cancellable<F, Fut>(
        &self,
        token: &CancellationToken,
        f: F,
    ) -> Result<Fut::Output, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.with_role_async_cancellable(Role::Reader, token, f)
            .await
    }

    /// Like [`with_write_lock_async`](Self::with_write_lock_async) but gives up if
    /// `token` is cancelled while waiting.
    pub async fn with_write_lock_async_cancellable<F, Fut>(
        &self,
        token: &CancellationToken,
        f: F,
    ) -> Result<Fut::Output, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.with_role_async_cancellable(Role::Writer, token, f)
            .await
    }

    async fn with_role_async_cancellable<F, Fut>(
        &self,
        role: Role,
        token: &CancellationToken,
        f: F,
    ) -> Result<Fut::Output, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        if let Entry::Nested = self.entry(role)? {
            return Ok(f().await);
        }
        self.shared
            .permits
            .acquire_cancellable(role.permits(), token)
            .await?;
        Ok(self.run_held_async(role, f).await)
    }

    async fn run_held_async<F, Fut>(&self, role: Role, f: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let _release = on_drop(|| self.shared.permits.release(role.permits()));
        Flow::capture()
            .with_hold(self.shared.id, role.hold())
            .scoped(f)
            .await
    }
}

impl Debug for ReentrantRwLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReentrantRwLock")
            .field("id", &self.shared.id)
            .field("readers", &self.reader_count())
            .field("write_locked", &self.is_write_locked())
            .finish_non_exhaustive()
    }
}

impl PartialEq for ReentrantRwLock {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for ReentrantRwLock {}
