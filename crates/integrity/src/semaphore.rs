use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use config::IntegrityConfig;

/// A counting semaphore with a bounded timed acquire.
#[derive(Debug)]
pub struct Semaphore {
    available: Mutex<usize>,
    capacity: usize,
    cond: Condvar,
}

impl Semaphore {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "semaphore capacity must be > 0");
        Self {
            available: Mutex::new(capacity),
            capacity,
            cond: Condvar::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently held.
    #[must_use]
    pub fn available(&self) -> usize {
        *self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a permit is free.
    pub fn acquire(&self) -> SemaphorePermit<'_> {
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        while *available == 0 {
            available = self
                .cond
                .wait(available)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *available -= 1;
        SemaphorePermit { semaphore: self }
    }

    /// Waits at most `timeout` for a permit.
    pub fn try_acquire_for(&self, timeout: Duration) -> Option<SemaphorePermit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        while *available == 0 {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(available, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            available = guard;
        }
        *available -= 1;
        Some(SemaphorePermit { semaphore: self })
    }

    fn release(&self) {
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(*available < self.capacity);
        *available += 1;
        drop(available);
        self.cond.notify_one();
    }
}

/// A held permit; dropping it releases the permit.
#[must_use = "the permit is released as soon as it is dropped"]
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Read and write semaphores shared by every hierarchical storage built
/// from the same limiter, plus the timed-acquire window.
///
/// Cloning shares the underlying semaphores.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    read: Arc<Semaphore>,
    write: Arc<Semaphore>,
    timeout: Duration,
}

impl ConcurrencyLimiter {
    pub fn new(read_capacity: usize, write_capacity: usize, timeout: Duration) -> Self {
        Self {
            read: Arc::new(Semaphore::new(read_capacity)),
            write: Arc::new(Semaphore::new(write_capacity)),
            timeout,
        }
    }

    pub fn from_config(config: &IntegrityConfig) -> Self {
        Self::new(
            config.read_concurrency,
            config.write_concurrency,
            config.access_timeout,
        )
    }

    #[must_use]
    pub fn read_semaphore(&self) -> &Semaphore {
        &self.read
    }

    #[must_use]
    pub fn write_semaphore(&self) -> &Semaphore {
        &self.write
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::from_config(&IntegrityConfig::default())
    }
}
