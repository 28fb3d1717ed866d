use std::ops::{Deref, DerefMut};
use std::time::Instant;
use tokio::sync::{RwLock, RwLockWriteGuard};

/// Write-lock hold time above which a warning is logged.
/// Embedding and disk I/O happen outside the lock, so only in-memory
/// appends and swaps should ever hold it.
pub const WRITE_LOCK_MAX_MS: u64 = 1000;


/// Write guard that logs how long the index state was held exclusively.
pub struct TimedWriteLockGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    start: Instant,
    context: &'static str,
}

impl<'a, T> TimedWriteLockGuard<'a, T> {
    pub async fn acquire(lock: &'a RwLock<T>, context: &'static str) -> Self {
        let wait_start = Instant::now();
        let guard = lock.write().await;
        let wait_ms = wait_start.elapsed().as_millis() as u64;

        if wait_ms > 100 {
            tracing::debug!(wait_ms, context, "Write lock wait time");
        }

        Self {
            guard,
            start: Instant::now(),
            context,
        }
    }
}

impl<T> Deref for TimedWriteLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for TimedWriteLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T> Drop for TimedWriteLockGuard<'_, T> {
    fn drop(&mut self) {
        let held_ms = self.start.elapsed().as_millis() as u64;

        #[cfg(test)]
        lock_metrics::record_held_ms(held_ms);

        if held_ms > WRITE_LOCK_MAX_MS {
            tracing::warn!(
                lock_held_ms = held_ms,
                threshold_ms = WRITE_LOCK_MAX_MS,
                context = self.context,
                "Write lock held beyond threshold"
            );
        } else {
            tracing::debug!(
                lock_held_ms = held_ms,
                context = self.context,
                "Write lock released"
            );
        }
    }
}
