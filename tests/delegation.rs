use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use qdlock::locks::FutexLock;
use qdlock::queue::BufferQueue;
use qdlock::reader::ReaderGroups;
use qdlock::Delegate;

/// Spawns `threads` threads running `f(lock, index)` and joins them.
fn run_threads<D, F>(lock: &Arc<D>, threads: usize, f: F)
where
    D: Send + Sync + 'static,
    F: Fn(&D, usize) + Send + Sync + Copy + 'static,
{
    let handles: Vec<_> = (0..threads)
        .map(|index| {
            let lock = Arc::clone(lock);
            thread::spawn(move || f(&lock, index))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Runs the delegation suite against one of the backing lock aliases.
macro_rules! delegation_suite {
    ($name:ident) => {
        mod $name {
            use super::*;

            type QdLock<T> = qdlock::$name::QdLock<T>;
            type MrQdLock<T> = qdlock::$name::MrQdLock<T>;

            fn lock_increments(threads: usize) {
                let lock = Arc::new(QdLock::new(0usize));
                run_threads(&lock, threads, |lock, _| *lock.lock() += 1);
                assert!(!lock.is_locked());
                assert_eq!(*lock.lock(), threads);
            }

            #[test]
            fn lock_single_thread() {
                lock_increments(1);
            }

            #[test]
            fn lock_many_threads() {
                lock_increments(128);
            }

            #[test]
            fn write_lock_many_threads() {
                let lock = Arc::new(MrQdLock::new(0usize));
                run_threads(&lock, 128, |lock, _| *lock.lock() += 1);
                assert_eq!(*lock.rlock(), 128);
            }

            #[test]
            fn fire_and_forget_then_marker() {
                const THREADS: usize = 128;
                let lock = Arc::new(QdLock::new(0usize));
                run_threads(&lock, THREADS, |lock, _| lock.delegate_no_result(|n| *n += 1));
                assert_eq!(lock.delegate_with_result(|n| *n).get(), THREADS);
            }

            #[test]
            fn mixed_lock_and_delegation() {
                const ITERS: usize = 500;
                let lock = Arc::new(QdLock::new(0usize));
                run_threads(&lock, 4, |lock, index| {
                    for run in 0..ITERS {
                        if (run + index) % 3 == 0 {
                            *lock.lock() += 1;
                        } else {
                            lock.delegate_no_result(|n| *n += 1);
                        }
                    }
                });
                let lock = Arc::try_unwrap(lock).ok().expect("workers joined");
                assert_eq!(lock.into_inner(), 4 * ITERS);
            }

            #[test]
            fn marker_orders_earlier_delegation() {
                const TRIALS: usize = 1000;
                let lock = Arc::new(QdLock::new(Vec::new()));
                let stop = Arc::new(AtomicBool::new(false));
                let noise = {
                    let lock = Arc::clone(&lock);
                    let stop = Arc::clone(&stop);
                    thread::spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            lock.delegate_no_result(|log: &mut Vec<usize>| log.push(usize::MAX));
                        }
                    })
                };
                let seen = Arc::new(AtomicUsize::new(usize::MAX));
                for trial in 0..TRIALS {
                    let c_seen = Arc::clone(&seen);
                    lock.delegate_no_result(move |log| {
                        log.push(trial);
                        c_seen.store(trial, Ordering::Relaxed);
                    });
                    lock.delegate_with_result(|_| ()).get();
                    assert_eq!(seen.load(Ordering::Relaxed), trial);
                }
                stop.store(true, Ordering::Relaxed);
                noise.join().unwrap();
                let log = lock.delegate_with_result(|log| {
                    log.retain(|&v| v != usize::MAX);
                    core::mem::take(log)
                });
                assert_eq!(log.get(), (0..TRIALS).collect::<Vec<_>>());
            }

            #[test]
            fn results_delivered_exactly_once() {
                const THREADS: usize = 8;
                const PER_THREAD: usize = 1250;
                let lock = Arc::new(QdLock::new(Vec::new()));
                let (tx, rx) = channel();
                let handles: Vec<_> = (0..THREADS)
                    .map(|index| {
                        let lock = Arc::clone(&lock);
                        let tx = tx.clone();
                        thread::spawn(move || {
                            let handles: Vec<_> = (0..PER_THREAD)
                                .map(|run| {
                                    let tag = index * PER_THREAD + run;
                                    lock.delegate_with_result(move |log: &mut Vec<usize>| {
                                        log.push(tag);
                                        tag
                                    })
                                })
                                .collect();
                            for handle in handles {
                                tx.send(handle.get()).unwrap();
                            }
                        })
                    })
                    .collect();
                drop(tx);
                for handle in handles {
                    handle.join().unwrap();
                }
                let mut tags: Vec<_> = rx.iter().collect();
                tags.sort_unstable();
                let expected: Vec<_> = (0..THREADS * PER_THREAD).collect();
                assert_eq!(tags, expected);
                let mut log = lock.delegate_with_result(|log| core::mem::take(log)).get();
                log.sort_unstable();
                assert_eq!(log, expected);
            }

            #[test]
            fn fixed_results_resolve() {
                const THREADS: usize = 4;
                const CALLS: usize = 4096;
                fn twenty_three(_: &mut ()) -> u32 {
                    23
                }
                let lock = Arc::new(QdLock::new(()));
                let (tx, rx) = channel();
                for _ in 0..THREADS {
                    let lock = Arc::clone(&lock);
                    let tx = tx.clone();
                    thread::spawn(move || {
                        let handles: Vec<_> =
                            (0..CALLS).map(|_| lock.delegate_with_result(twenty_three)).collect();
                        let values: Vec<_> = handles.into_iter().map(|h| h.get()).collect();
                        tx.send(values).unwrap();
                    });
                }
                drop(tx);
                let mut collected = 0;
                for _ in 0..THREADS {
                    let values = rx.recv_timeout(Duration::from_secs(120)).unwrap();
                    assert!(values.iter().all(|&v| v == 23));
                    collected += values.len();
                }
                assert_eq!(collected, THREADS * CALLS);
            }

            #[test]
            fn readers_see_whole_writes() {
                struct Pair {
                    a: u64,
                    b: u64,
                }
                let lock = Arc::new(MrQdLock::new(Pair { a: 0, b: 0 }));
                let stop = Arc::new(AtomicBool::new(false));
                let readers: Vec<_> = (0..4)
                    .map(|_| {
                        let lock = Arc::clone(&lock);
                        let stop = Arc::clone(&stop);
                        thread::spawn(move || {
                            while !stop.load(Ordering::Relaxed) {
                                let pair = lock.rlock();
                                assert_eq!(pair.a, pair.b);
                            }
                        })
                    })
                    .collect();
                run_threads(&lock, 2, |lock, _| {
                    for _ in 0..1000 {
                        lock.delegate_no_result(|pair| {
                            pair.a += 1;
                            pair.b += 1;
                        });
                    }
                });
                stop.store(true, Ordering::Relaxed);
                for reader in readers {
                    reader.join().unwrap();
                }
                let (a, b) = lock.delegate_with_result(|pair| (pair.a, pair.b)).get();
                assert_eq!((a, b), (2000, 2000));
            }
        }
    };
}

delegation_suite!(tatas);
delegation_suite!(futex);
delegation_suite!(mcs);
delegation_suite!(ticket);

/// A reader/writer lock whose readers give up quickly.
type Impatient<T> = qdlock::MrQdLock<T, FutexLock, BufferQueue<1024>, ReaderGroups<4>, 8>;

#[test]
fn writers_progress_under_reader_flood() {
    const WRITES: usize = 200;
    let lock = Arc::new(Impatient::new(0usize));
    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicUsize::new(0));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let stop = Arc::clone(&stop);
            let reads = Arc::clone(&reads);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let value = *lock.rlock();
                    assert!(value <= WRITES);
                    reads.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    let (tx, rx) = channel();
    let writer = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            for _ in 0..WRITES {
                lock.delegate_with_result(|n| *n += 1).get();
            }
            tx.send(()).unwrap();
        })
    };
    let finished = rx.recv_timeout(Duration::from_secs(120));
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert!(finished.is_ok(), "writer starved by readers");
    assert_eq!(*lock.rlock(), WRITES);
}

#[test]
fn default_aliases_are_interchangeable() {
    let lock = qdlock::QdLock::<u64>::new(1);
    let futex = qdlock::futex::QdLock::<u64>::new(1);
    lock.delegate_no_result(|n| *n *= 3);
    futex.delegate_no_result(|n| *n *= 3);
    assert_eq!(lock.into_inner(), futex.into_inner());
}
