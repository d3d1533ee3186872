use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use core::sync::atomic::{AtomicBool, AtomicUsize};

use crossbeam_utils::CachePadded;

use super::{DelegationQueue, Rejected, State};
use crate::cfg::debug_abort;
use crate::relax::{Relax, Spin};

/// Size of the per entry size header, every entry is aligned to it.
const WORD: usize = size_of::<AtomicUsize>();

/// Runs (or, given a null context, drops) the record stored at the pointer.
type Call = unsafe fn(*mut u8, *mut ());

/// The part of an entry that follows its size header.
#[repr(C)]
struct Record<F> {
    call: Call,
    op: F,
}

/// A bounded delegation queue backed by a fixed size buffer.
///
/// Producers reserve room for an entry with a single `fetch_add` on a bump
/// counter, move the operation into the reserved bytes and finally publish
/// the entry by storing its size in the entry's header word with release
/// ordering. The combiner walks the buffer in reservation order, waiting on
/// each header until it becomes nonzero, runs the operation in place and
/// zeroes the bytes it consumed. No allocation happens for operations that
/// are at most word aligned and fit in the buffer, larger aligned ones are
/// boxed first.
///
/// `SIZE` is the capacity in bytes, it must be a multiple of the word size
/// and hold at least two words. A producer whose reservation runs past the
/// end of the buffer writes a sentinel header (`SIZE + 1`) at its offset so
/// the combiner knows where the accepted entries end.
///
/// # Example
///
/// ```
/// use qdlock::queue::{BufferQueue, DelegationQueue, State};
///
/// let queue = BufferQueue::<256>::new();
/// queue.open();
/// queue.enqueue(|total: &mut u32| *total += 2).unwrap();
/// queue.enqueue(|total: &mut u32| *total *= 10).unwrap();
///
/// let mut total: u32 = 1;
/// // SAFETY: Single flusher, all operations act on `u32`.
/// unsafe { queue.flush(&mut total) };
/// assert_eq!(total, 30);
/// assert_eq!(queue.state(), State::Closed);
/// ```
pub struct BufferQueue<const SIZE: usize> {
    counter: CachePadded<AtomicUsize>,
    closed: AtomicBool,
    buffer: Box<[AtomicUsize]>,
}

impl<const SIZE: usize> BufferQueue<SIZE> {
    const WORDS: usize = {
        assert!(SIZE % WORD == 0, "buffer queue capacity must be a multiple of the word size");
        assert!(SIZE >= 2 * WORD, "buffer queue capacity must hold at least two words");
        SIZE / WORD
    };

    const SENTINEL: usize = SIZE + 1;

    /// Creates a new, closed queue with a zeroed buffer of `SIZE` bytes.
    pub fn new() -> Self {
        let buffer = (0..Self::WORDS).map(|_| AtomicUsize::new(0)).collect();
        let counter = CachePadded::new(AtomicUsize::new(SIZE));
        Self { counter, closed: AtomicBool::new(true), buffer }
    }

    /// Rounds `size` up to the alignment of entry headers.
    const fn aligned(size: usize) -> usize {
        (size + WORD - 1) / WORD * WORD
    }

    /// The number of bytes an entry holding `F` takes, header included.
    const fn entry_size<F>() -> usize {
        Self::aligned(WORD + size_of::<Record<F>>())
    }

    const fn fits_inline<F>() -> bool {
        align_of::<Record<F>>() <= WORD && Self::entry_size::<F>() <= SIZE
    }

    fn base(&self) -> *mut u8 {
        // The buffer is made of atomics, which allow writes through shared
        // references.
        self.buffer.as_ptr().cast_mut().cast()
    }

    fn header(&self, index: usize) -> &AtomicUsize {
        &self.buffer[index / WORD]
    }

    fn record(&self, index: usize) -> *mut u8 {
        // SAFETY: `index` is the offset of an entry, which always leaves
        // room for the header inside the buffer.
        unsafe { self.base().add(index + WORD) }
    }

    /// Reserves room for `op` and writes it in place, without boxing.
    fn push<T, F>(&self, op: F) -> Result<(), Rejected<F>>
    where
        F: FnOnce(&mut T) + Send,
    {
        if self.closed.load(Relaxed) {
            return Err(Rejected::new(op, State::Closed));
        }
        let size = Self::entry_size::<F>();
        // Acquire pairs with the release in `open`, so that the zeroing done
        // by the previous flush happens before this entry is written.
        let index = self.counter.fetch_add(size, Acquire);
        if index.saturating_add(size) <= SIZE {
            let record = Record { call: invoke::<T, F>, op };
            // SAFETY: The bytes `index..index + size` are reserved for this
            // thread alone, in bounds and word aligned, which is enough for
            // `Record<F>` as checked by `fits_inline`.
            unsafe { ptr::write(self.record(index).cast::<Record<F>>(), record) };
            self.header(index).store(size, Release);
            return Ok(());
        }
        // Only the reservation that straddles the end of the buffer starts in
        // bounds, so exactly one producer writes the sentinel.
        if index < SIZE {
            self.header(index).store(Self::SENTINEL, Release);
            log::trace!("buffer queue of {} bytes is full", SIZE);
        }
        Err(Rejected::new(op, State::Full))
    }

    /// Spins until the entry header at `index` has been published.
    fn wait_header(&self, index: usize) -> usize {
        let header = self.header(index);
        let mut relax = Spin::new();
        loop {
            let size = header.load(Acquire);
            if size != 0 {
                return size;
            }
            relax.relax();
        }
    }

    /// Zeroes `size` bytes starting at `index`.
    fn clear(&self, index: usize, size: usize) {
        for word in &self.buffer[index / WORD..(index + size) / WORD] {
            word.store(0, Relaxed);
        }
    }

    fn close(&self) {
        self.closed.store(true, Relaxed);
    }

    #[cfg(all(not(loom), test))]
    fn is_zeroed(&self) -> bool {
        self.buffer.iter().all(|word| word.load(Relaxed) == 0)
    }
}

impl<const SIZE: usize> DelegationQueue for BufferQueue<SIZE> {
    fn new() -> Self {
        Self::new()
    }

    fn open(&self) {
        self.counter.store(0, Release);
        self.closed.store(false, Relaxed);
    }

    fn enqueue<T, F>(&self, op: F) -> Result<(), Rejected<F>>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        if Self::fits_inline::<F>() {
            self.push::<T, F>(op)
        } else {
            self.push::<T, Box<F>>(Box::new(op)).map_err(|rejected| rejected.map(|op| *op))
        }
    }

    unsafe fn flush<T>(&self, data: &mut T) {
        let ctx = (data as *mut T).cast::<()>();
        let mut todo = 0;
        let mut open = true;
        while open {
            let done = todo;
            todo = self.counter.load(Relaxed);
            if todo == done {
                // No new entries since the last pass, stop accepting more.
                todo = self.counter.swap(SIZE, Relaxed);
                open = false;
                self.close();
            }
            if todo >= SIZE {
                todo = SIZE;
                open = false;
                self.close();
            }
            let mut index = done;
            while index < todo {
                let size = self.wait_header(index);
                if size == Self::SENTINEL {
                    self.clear(index, WORD);
                    return;
                }
                let record = self.record(index);
                // SAFETY: The header was published with release ordering
                // after the record was fully written, and every record
                // starts with its `Call`.
                let call = unsafe { ptr::read(record.cast::<Call>()) };
                // SAFETY: Caller guarantees the record was enqueued for `T`,
                // and it is consumed exactly once, here.
                debug_abort::on_unwind(|| unsafe { call(record, ctx) });
                self.clear(index, size);
                index += size;
            }
        }
    }

    fn state(&self) -> State {
        if self.closed.load(Relaxed) {
            State::Closed
        } else if self.counter.load(Relaxed) >= SIZE {
            State::Full
        } else {
            State::Open
        }
    }
}

impl<const SIZE: usize> Default for BufferQueue<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize> Drop for BufferQueue<SIZE> {
    fn drop(&mut self) {
        if *self.closed.get_mut() {
            return;
        }
        // Drop operations that were accepted but never flushed.
        let end = (*self.counter.get_mut()).min(SIZE);
        let mut index = 0;
        while index < end {
            let size = *self.buffer[index / WORD].get_mut();
            if size == 0 || size == Self::SENTINEL {
                break;
            }
            let record = self.record(index);
            // SAFETY: Published records start with their `Call`, a null
            // context drops the operation without running it.
            unsafe {
                let call = ptr::read(record.cast::<Call>());
                call(record, ptr::null_mut());
            }
            index += size;
        }
    }
}

impl<const SIZE: usize> fmt::Debug for BufferQueue<SIZE> {
    #[cfg(not(tarpaulin_include))]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferQueue")
            .field("capacity", &SIZE)
            .field("state", &self.state())
            .finish()
    }
}

/// Moves the `Record<F>` out of `record` and runs its operation against
/// `ctx`, or drops it if `ctx` is null.
///
/// # Safety
///
/// `record` must point to an initialized `Record<F>` that is not read again,
/// and a non-null `ctx` must point to a `T` with no other live references.
unsafe fn invoke<T, F: FnOnce(&mut T)>(record: *mut u8, ctx: *mut ()) {
    // SAFETY: Caller guarantees `record` holds a `Record<F>`.
    let Record { op, .. } = unsafe { ptr::read(record.cast::<Record<F>>()) };
    if !ctx.is_null() {
        // SAFETY: Caller guarantees exclusive access to the `T`.
        op(unsafe { &mut *ctx.cast::<T>() });
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::{BufferQueue, WORD};
    use crate::queue::{DelegationQueue, State};

    /// A recognizable four word payload.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct Canary([usize; 4]);

    impl Canary {
        fn new(tag: usize) -> Self {
            Self([tag, !tag, tag.rotate_left(7), 0xA5A5])
        }

        fn check(self) -> usize {
            assert_eq!(self, Self::new(self.0[0]), "corrupted canary");
            self.0[0]
        }
    }

    fn canary_op(tag: usize) -> impl FnOnce(&mut Vec<usize>) + Send + 'static {
        let canary = Canary::new(tag);
        move |log: &mut Vec<usize>| log.push(canary.check())
    }

    fn entry_size_of<const SIZE: usize, F>(_: &F) -> usize {
        BufferQueue::<SIZE>::entry_size::<F>()
    }

    // A canary op is a call pointer plus four words, after a header word.
    const ENTRY: usize = 6 * WORD;

    #[test]
    fn starts_closed() {
        let queue = BufferQueue::<256>::new();
        assert_eq!(queue.state(), State::Closed);
        let rejected = queue.enqueue::<Vec<usize>, _>(canary_op(1)).unwrap_err();
        assert_eq!(rejected.state(), State::Closed);
        let mut log: Vec<usize> = Vec::new();
        (rejected.into_inner())(&mut log);
        assert_eq!(log, [1]);
    }

    #[test]
    fn flush_runs_in_order_and_zeroes() {
        let queue = BufferQueue::<1024>::new();
        queue.open();
        assert_eq!(queue.state(), State::Open);
        for tag in 0..10 {
            queue.enqueue::<Vec<usize>, _>(canary_op(tag)).unwrap();
        }
        let mut log: Vec<usize> = Vec::new();
        // SAFETY: Single flusher, all operations act on `Vec<usize>`.
        unsafe { queue.flush(&mut log) };
        assert_eq!(log, (0..10).collect::<Vec<_>>());
        assert_eq!(queue.state(), State::Closed);
        assert!(queue.is_zeroed());
    }

    #[test]
    fn reopen_after_flush() {
        let queue = BufferQueue::<1024>::new();
        let mut log: Vec<usize> = Vec::new();
        for round in 0..3 {
            queue.open();
            queue.enqueue::<Vec<usize>, _>(canary_op(round)).unwrap();
            // SAFETY: Single flusher, all operations act on `Vec<usize>`.
            unsafe { queue.flush(&mut log) };
        }
        assert_eq!(log, [0, 1, 2]);
    }

    #[test]
    fn exact_capacity_boundary() {
        const SIZE: usize = 4 * ENTRY;
        assert_eq!(entry_size_of::<SIZE, _>(&canary_op(0)), ENTRY);
        let queue = BufferQueue::<SIZE>::new();
        queue.open();
        for tag in 0..4 {
            queue.enqueue::<Vec<usize>, _>(canary_op(tag)).unwrap();
        }
        assert_eq!(queue.state(), State::Full);
        let rejected = queue.enqueue::<Vec<usize>, _>(canary_op(4)).unwrap_err();
        assert_eq!(rejected.state(), State::Full);
        let mut log: Vec<usize> = Vec::new();
        // SAFETY: Single flusher, all operations act on `Vec<usize>`.
        unsafe { queue.flush(&mut log) };
        assert_eq!(log, [0, 1, 2, 3]);
        assert_eq!(queue.state(), State::Closed);
        assert!(queue.is_zeroed());
    }

    #[test]
    fn straddling_entry_writes_sentinel() {
        const SIZE: usize = 4 * ENTRY + 2 * WORD;
        let queue = BufferQueue::<SIZE>::new();
        queue.open();
        for tag in 0..4 {
            queue.enqueue::<Vec<usize>, _>(canary_op(tag)).unwrap();
        }
        assert_eq!(queue.state(), State::Open);
        let rejected = queue.enqueue::<Vec<usize>, _>(canary_op(4)).unwrap_err();
        assert_eq!(rejected.state(), State::Full);
        assert_eq!(queue.header(4 * ENTRY).load(Ordering::Relaxed), SIZE + 1);
        // Later reservations start out of bounds and write nothing.
        let rejected = queue.enqueue::<Vec<usize>, _>(canary_op(5)).unwrap_err();
        assert_eq!(rejected.state(), State::Full);
        let mut log: Vec<usize> = Vec::new();
        // SAFETY: Single flusher, all operations act on `Vec<usize>`.
        unsafe { queue.flush(&mut log) };
        assert_eq!(log, [0, 1, 2, 3]);
        assert!(queue.is_zeroed());
    }

    #[test]
    fn over_aligned_ops_are_boxed() {
        #[repr(align(128))]
        struct Aligned(usize);

        let queue = BufferQueue::<256>::new();
        queue.open();
        let aligned = Aligned(7);
        queue.enqueue(move |sum: &mut usize| *sum += aligned.0).unwrap();
        let mut sum: usize = 0;
        // SAFETY: Single flusher, all operations act on `usize`.
        unsafe { queue.flush(&mut sum) };
        assert_eq!(sum, 7);
    }

    #[test]
    fn drop_releases_pending_ops() {
        let token = Arc::new(());
        {
            let queue = BufferQueue::<256>::new();
            queue.open();
            for _ in 0..3 {
                let token = Arc::clone(&token);
                queue.enqueue(move |_: &mut ()| drop(token)).unwrap();
            }
            assert_eq!(Arc::strong_count(&token), 4);
        }
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn concurrent_producers_single_flusher() {
        const THREADS: usize = 8;
        const OPS: usize = 2000;

        let queue = Arc::new(BufferQueue::<512>::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let finished = Arc::clone(&finished);
                thread::spawn(move || {
                    for _ in 0..OPS {
                        let mut op = |count: &mut usize| *count += 1;
                        while let Err(rejected) = queue.enqueue(op) {
                            op = rejected.into_inner();
                            thread::yield_now();
                        }
                    }
                    finished.fetch_add(1, Ordering::Release);
                })
            })
            .collect();

        let mut count: usize = 0;
        loop {
            let done = finished.load(Ordering::Acquire) == THREADS;
            queue.open();
            // SAFETY: This thread is the only flusher, all ops act on `usize`.
            unsafe { queue.flush(&mut count) };
            if done {
                break;
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(count, THREADS * OPS);
        assert!(queue.is_zeroed());
    }
}
