// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;

use crate::yield_now;

/// Guard type returned by [`SpinYieldLock::lock`]; unlocks on drop.
pub type SpinYieldGuard<'a, T, R = spin::Mutex<()>> = lock_api::MutexGuard<'a, R, T>;

/// A mutex adapter that yields to the scheduler instead of blocking the OS
/// thread.
///
/// Acquisition is a try-lock loop over any [`lock_api::RawMutex`] (a plain
/// spin lock by default): on contention the calling routine is suspended
/// and another gets the worker, so a lock held by a preempted routine never
/// wedges the thread that wants it. Off the worker pool the yield degrades
/// to an OS-level thread yield.
///
/// Critical sections must not yield while holding the guard for longer than
/// they have to; like any spin lock this is meant for short, bounded work.
pub struct SpinYieldLock<T, R = spin::Mutex<()>> {
    inner: lock_api::Mutex<R, T>,
}

impl<T> SpinYieldLock<T> {
    pub const fn new(value: T) -> Self {
        Self::with_raw_mutex(value)
    }
}

impl<T, R: lock_api::RawMutex> SpinYieldLock<T, R> {
    /// Like [`SpinYieldLock::new`], for a caller-chosen raw mutex.
    pub const fn with_raw_mutex(value: T) -> Self {
        Self {
            inner: lock_api::Mutex::const_new(R::INIT, value),
        }
    }

    /// Acquires the lock, yielding to the scheduler between attempts.
    pub fn lock(&self) -> SpinYieldGuard<'_, T, R> {
        loop {
            if let Some(guard) = self.inner.try_lock() {
                return guard;
            }
            yield_now();
        }
    }

    /// A single acquisition attempt, never yielding.
    pub fn try_lock(&self) -> Option<SpinYieldGuard<'_, T, R>> {
        self.inner.try_lock()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: fmt::Debug, R: lock_api::RawMutex> fmt::Debug for SpinYieldLock<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("SpinYieldLock");
        match self.try_lock() {
            Some(guard) => out.field("data", &&*guard),
            None => out.field("data", &format_args!("<locked>")),
        };
        out.finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinYieldLock::new(1u32);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn contended_increments_from_std_threads_all_land() {
        const THREADS: usize = 8;
        const INCREMENTS: usize = 1_000;

        let counter = Arc::new(SpinYieldLock::new(0u64));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..INCREMENTS {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), (THREADS * INCREMENTS) as u64);
    }
}
