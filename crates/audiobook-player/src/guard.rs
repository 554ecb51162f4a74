//! Process-wide guard around the decode library.
//!
//! Every open/seek/read/close sequence against a container runs while holding a
//! [`DecodeLease`]. Container and decoder handles borrow the lease, so they cannot
//! outlive it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

static DECODE_LOCK: Mutex<()> = Mutex::new(());

static ACQUISITIONS: AtomicU64 = AtomicU64::new(0);
static HOLDERS: AtomicUsize = AtomicUsize::new(0);
static MAX_HOLDERS: AtomicUsize = AtomicUsize::new(0);

/// Exclusive ownership of the decode library. Dropping it releases the guard.
pub struct DecodeLease {
    _guard: MutexGuard<'static, ()>,
}

/// Acquisition counters for the decode guard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuardStats {
    /// Total leases handed out since process start.
    pub acquisitions: u64,
    /// Leases currently held (0 or 1).
    pub holders: usize,
    /// Highest number of simultaneous holders ever observed.
    pub max_holders: usize,
}

/// Block until the decode library is free, then take it.
pub fn acquire() -> DecodeLease {
    // Poisoning only means a previous holder panicked; the library state is
    // reopened from scratch by every sequence.
    let guard = DECODE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    ACQUISITIONS.fetch_add(1, Ordering::Relaxed);
    let holders = HOLDERS.fetch_add(1, Ordering::AcqRel) + 1;
    MAX_HOLDERS.fetch_max(holders, Ordering::AcqRel);
    tracing::trace!(holders, "decode guard acquired");
    DecodeLease { _guard: guard }
}

/// Take the decode library if nobody holds it.
pub fn try_acquire() -> Option<DecodeLease> {
    let guard = match DECODE_LOCK.try_lock() {
        Ok(g) => g,
        Err(std::sync::TryLockError::Poisoned(p)) => p.into_inner(),
        Err(std::sync::TryLockError::WouldBlock) => return None,
    };
    ACQUISITIONS.fetch_add(1, Ordering::Relaxed);
    let holders = HOLDERS.fetch_add(1, Ordering::AcqRel) + 1;
    MAX_HOLDERS.fetch_max(holders, Ordering::AcqRel);
    Some(DecodeLease { _guard: guard })
}

/// Snapshot of the acquisition counters.
pub fn stats() -> GuardStats {
    GuardStats {
        acquisitions: ACQUISITIONS.load(Ordering::Relaxed),
        holders: HOLDERS.load(Ordering::Acquire),
        max_holders: MAX_HOLDERS.load(Ordering::Acquire),
    }
}

impl Drop for DecodeLease {
    fn drop(&mut self) {
        // Decrement before the mutex guard field is dropped.
        HOLDERS.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!("decode guard released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn leases_are_exclusive_across_threads() {
        let threads = 4;
        let barrier = Arc::new(Barrier::new(threads));
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..threads {
            let barrier = barrier.clone();
            let inside = inside.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..20 {
                    let _lease = acquire();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    assert_eq!(now, 1);
                    thread::sleep(Duration::from_micros(200));
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats().max_holders, 1);
    }

    #[test]
    fn acquisitions_are_counted() {
        let before = stats().acquisitions;
        drop(acquire());
        drop(acquire());
        assert!(stats().acquisitions >= before + 2);
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let lease = acquire();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            tx.send(try_acquire().is_some()).unwrap();
        });
        let got = rx.recv().unwrap();
        handle.join().unwrap();
        drop(lease);
        assert!(!got);
    }
}
