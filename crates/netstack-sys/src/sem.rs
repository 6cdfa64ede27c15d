//! `sys_sem_t`: the counting semaphore a blocking API call waits on while the protocol thread
//! processes the message it just posted.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut count = self.count.lock().expect("semaphore poisoned");
        *count += 1;
        self.condvar.notify_one();
    }

    /// Blocks until signaled.
    pub fn wait(&self) {
        let mut count = self.count.lock().expect("semaphore poisoned");
        while *count == 0 {
            count = self.condvar.wait(count).expect("semaphore poisoned");
        }
        *count -= 1;
    }

    /// Blocks until signaled or `timeout` elapses; returns `false` on timeout (the caller's
    /// `TIMEOUT` result).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock().expect("semaphore poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while *count == 0 {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, result) = self.condvar.wait_timeout(count, remaining).expect("semaphore poisoned");
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_blocks_until_signal() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sem2.signal();
        });
        sem.wait();
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires_without_signal() {
        let sem = Semaphore::new(0);
        assert!(!sem.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn wait_timeout_succeeds_when_signaled_in_time() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        thread::spawn(move || sem2.signal());
        assert!(sem.wait_timeout(Duration::from_secs(2)));
    }
}
