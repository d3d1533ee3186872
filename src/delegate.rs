use crate::promise::{self, Promise, ResultHandle};

/// The delegation entry points shared by every delegation lock.
///
/// An operation handed to a delegation lock runs exactly once, with
/// exclusive access to the protected data, on whichever thread is the
/// combiner at the time. That may be the calling thread, and the call may
/// return before the operation ran. Operations must therefore be `Send` and
/// `'static`, and report back through a [`Promise`] or a caller supplied
/// sink when the caller needs to observe their effect.
///
/// Operations must not delegate to or lock the same lock: the combiner runs
/// them while holding it.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use qdlock::{Delegate, QdLock};
///
/// let counter = Arc::new(QdLock::<u64>::new(0));
/// let handles: Vec<_> = (0..4)
///     .map(|_| {
///         let counter = Arc::clone(&counter);
///         thread::spawn(move || {
///             for _ in 0..1000 {
///                 counter.delegate_no_result(|n| *n += 1);
///             }
///         })
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert_eq!(counter.delegate_with_result(|n| *n).get(), 4000);
/// ```
pub trait Delegate {
    /// The type of the protected data.
    type Target;

    /// Runs `op` on the protected data, without waiting for it to complete.
    fn delegate_no_result<F>(&self, op: F)
    where
        F: FnOnce(&mut Self::Target) + Send + 'static;

    /// Runs `op` on the protected data and returns a handle to its result.
    fn delegate_with_result<F, R>(&self, op: F) -> ResultHandle<R>
    where
        F: FnOnce(&mut Self::Target) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (promise, handle) = promise::channel();
        self.delegate_no_result(move |data| promise.set(op(data)));
        handle
    }

    /// Runs `op` on the protected data, handing it `sink` to report to.
    fn delegate_with_sink<F, S>(&self, sink: S, op: F)
    where
        F: FnOnce(&mut Self::Target, S) + Send + 'static,
        S: Send + 'static,
    {
        self.delegate_no_result(move |data| op(data, sink));
    }

    /// Runs `op` on the protected data with a promise it is responsible
    /// for fulfilling, and returns the matching handle.
    ///
    /// If `op` drops the promise without setting it, the handle is broken.
    fn delegate_with_promise<F, R>(&self, op: F) -> ResultHandle<R>
    where
        F: FnOnce(&mut Self::Target, Promise<R>) + Send + 'static,
        R: Send + 'static,
    {
        let (promise, handle) = promise::channel();
        self.delegate_with_sink(promise, op);
        handle
    }
}
