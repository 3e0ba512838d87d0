//! Counting semaphore for the capture-thread hand-off.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A counting semaphore with a deadline-bounded wait.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Decrements the counter, blocking up to `timeout`.
    ///
    /// Returns `true` if the semaphore was acquired, `false` on timeout.
    /// A timed-out wait leaves no residue; the counter is untouched.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Increments the counter and wakes one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_succeeds_after_post() {
        let sem = Semaphore::new(0);
        sem.post();
        assert!(sem.wait(Duration::from_millis(10)));
    }

    #[test]
    fn wait_times_out() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert!(!sem.wait(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn post_wakes_waiter_across_threads() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || sem.wait(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        sem.post();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn initial_count_is_consumable() {
        let sem = Semaphore::new(2);
        assert!(sem.wait(Duration::from_millis(1)));
        assert!(sem.wait(Duration::from_millis(1)));
        assert!(!sem.wait(Duration::from_millis(1)));
    }
}
