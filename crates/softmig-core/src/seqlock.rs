//! Sequence counter for per-slot usage counters
//!
//! Writers bump the counter to odd, update the counters, and bump it back to
//! even. Readers retry until they observe the same even value before and
//! after reading. Readers never block writers.
//!
//! # Design
//!
//! Lives inside the shared region, so it is `repr(transparent)` over a
//! single `AtomicU64` and must stay valid when zero-filled.
//!
//! Writers claim the counter with an even->odd CAS, so two threads of the
//! same process never interleave on one slot. A writer that finds the
//! counter odd for `SEQLOCK_WRITE_SPINS` iterations assumes the previous
//! writer died mid-update and proceeds; its release makes the counter even
//! again.
//!
//! Readers give up after `SEQLOCK_READ_RETRIES` attempts and return a best
//! effort value marked `consistent: false`, so a crashed writer can delay a
//! reader but never hang it.

use core::hint::spin_loop;
use core::sync::atomic::{fence, AtomicU64, Ordering};

use tracing::warn;

use crate::constants::{SEQLOCK_READ_RETRIES, SEQLOCK_WRITE_SPINS};

/// Sequence counter (see module docs)
#[repr(transparent)]
#[derive(Debug)]
pub struct SeqLock {
    seq: AtomicU64,
}

/// Result of a seqlock-protected read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRead<T> {
    pub value: T,
    /// False when the retry budget ran out and `value` may be torn
    pub consistent: bool,
}

impl SeqLock {
    /// Create a counter in the even (idle) state
    pub const fn new() -> Self {
        SeqLock {
            seq: AtomicU64::new(0),
        }
    }

    /// Current raw counter value
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Is a writer currently inside its critical section?
    #[inline]
    pub fn is_writing(&self) -> bool {
        self.sequence() & 1 == 1
    }

    /// Force the counter back to zero
    ///
    /// Only valid while no other writer can touch the slot, i.e. under the
    /// region lock during (re)registration.
    pub fn reset(&self) {
        self.seq.store(0, Ordering::Release);
    }

    /// Enter the write side
    pub fn write(&self) -> SeqWriteGuard<'_> {
        let mut spins = 0u32;
        loop {
            let cur = self.seq.load(Ordering::Relaxed);
            if cur & 1 == 0 {
                if self
                    .seq
                    .compare_exchange_weak(cur, cur.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    fence(Ordering::Release);
                    return SeqWriteGuard { seq: &self.seq };
                }
            } else if spins >= SEQLOCK_WRITE_SPINS {
                warn!(seq = cur, "seqlock writer stuck mid-update, taking over");
                fence(Ordering::Release);
                return SeqWriteGuard { seq: &self.seq };
            }

            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                spin_loop();
            }
        }
    }

    /// Run `f` until it observes a stable snapshot
    pub fn read<T>(&self, mut f: impl FnMut() -> T) -> SeqRead<T> {
        for _ in 0..SEQLOCK_READ_RETRIES {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::thread::yield_now();
                continue;
            }

            let value = f();
            fence(Ordering::Acquire);
            let after = self.seq.load(Ordering::Relaxed);
            if before == after {
                return SeqRead {
                    value,
                    consistent: true,
                };
            }
        }

        SeqRead {
            value: f(),
            consistent: false,
        }
    }
}

impl Default for SeqLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Write-side guard; leaving the critical section makes the counter even
pub struct SeqWriteGuard<'a> {
    seq: &'a AtomicU64,
}

impl Drop for SeqWriteGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.seq.fetch_add(1, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_write_leaves_counter_even() {
        let lock = SeqLock::new();
        {
            let _g = lock.write();
            assert!(lock.is_writing());
        }
        assert!(!lock.is_writing());
        assert_eq!(lock.sequence(), 2);
    }

    #[test]
    fn test_read_idle_is_consistent() {
        let lock = SeqLock::new();
        let r = lock.read(|| 7);
        assert_eq!(r, SeqRead { value: 7, consistent: true });
    }

    #[test]
    fn test_read_gives_up_on_dead_writer() {
        let lock = SeqLock::new();
        // Writer "dies" mid-update: guard leaked, counter stays odd
        core::mem::forget(lock.write());
        let r = lock.read(|| 1);
        assert!(!r.consistent);
        assert_eq!(r.value, 1);
    }

    #[test]
    fn test_reset() {
        let lock = SeqLock::new();
        drop(lock.write());
        lock.reset();
        assert_eq!(lock.sequence(), 0);
    }

    #[test]
    fn test_readers_never_see_torn_pair() {
        struct Pair {
            lock: SeqLock,
            a: AtomicU64,
            b: AtomicU64,
        }

        let pair = Arc::new(Pair {
            lock: SeqLock::new(),
            a: AtomicU64::new(0),
            b: AtomicU64::new(0),
        });

        let writer = {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                for _ in 0..20_000 {
                    let _g = pair.lock.write();
                    pair.a.fetch_add(1, Ordering::Relaxed);
                    pair.b.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        for _ in 0..20_000 {
            let r = pair.lock.read(|| {
                (pair.a.load(Ordering::Relaxed), pair.b.load(Ordering::Relaxed))
            });
            if r.consistent {
                assert_eq!(r.value.0, r.value.1);
            }
        }

        writer.join().unwrap();
        assert_eq!(pair.a.load(Ordering::Relaxed), 20_000);
        assert!(!pair.lock.is_writing());
    }
}
