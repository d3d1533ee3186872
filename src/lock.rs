/// The capability set shared by every mutual exclusion lock that can back a
/// delegation lock.
///
/// A `RawLock` carries no data, it only manages the state of the lock. The
/// delegation locks ([`QdLock`], [`MrQdLock`]) own the protected data and
/// hand out guards, so user code rarely calls these methods directly.
///
/// # Safety
///
/// Implementors must guarantee mutual exclusion: after `lock` returns, or
/// `try_lock`/`try_lock_or_wait` return `true`, no other thread may acquire
/// the lock until `unlock` is called. Acquisitions must synchronize with
/// the previous `unlock` (acquire and release semantics).
///
/// [`QdLock`]: crate::qd::QdLock
/// [`MrQdLock`]: crate::mrqd::MrQdLock
pub unsafe trait RawLock {
    /// Creates a new unlocked instance.
    fn new() -> Self;

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `true` if the lock was acquired.
    fn try_lock(&self) -> bool;

    /// Acquires the lock, blocking or spinning until it is available.
    fn lock(&self);

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held by the current context, acquired through
    /// `lock`, `try_lock` or `try_lock_or_wait`.
    unsafe fn unlock(&self);

    /// Returns `true` if the lock is currently held.
    ///
    /// This function does not guarantee strong ordering, only atomicity.
    fn is_locked(&self) -> bool;

    /// Attempts to acquire the lock, and if that fails, waits until the
    /// current holder unlocks it.
    ///
    /// Returns `true` if the lock was acquired, `false` after having waited
    /// for an unlock (or spuriously). Locks without blocking support just
    /// try once.
    fn try_lock_or_wait(&self) -> bool {
        self.try_lock()
    }
}
