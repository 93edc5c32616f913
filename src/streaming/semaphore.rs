//! Counting semaphore used to wake the worker threads

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Counting semaphore built on a mutex-guarded count and a condvar.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Add one permit and wake a single waiter.
    pub fn release(&self) {
        *self.count.lock() += 1;
        self.available.notify_one();
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Take a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            self.available.wait_for(&mut count, timeout);
            if *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    pub fn permits(&self) -> usize {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_acquire_counts() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert_eq!(sem.permits(), 1);
    }

    #[test]
    fn test_acquire_timeout_expires() {
        let sem = Semaphore::new(0);
        assert!(!sem.acquire_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_release_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire())
        };
        sem.release();
        waiter.join().expect("waiter panicked");
        assert_eq!(sem.permits(), 0);
    }
}
