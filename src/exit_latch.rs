// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One-shot gate that opens when the camera confirms release following an
/// explicit close. Once open it stays open; a new close request gets a new
/// latch.
pub struct ExitLatch {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Default for ExitLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitLatch {
    pub fn new() -> Self {
        ExitLatch{open: Mutex::new(false), opened: Condvar::new()}
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false if the latch was already open.
    pub fn open(&self) -> bool {
        let mut open = self.lock();
        if *open {
            return false;
        }
        *open = true;
        self.opened.notify_all();
        true
    }

    pub fn is_open(&self) -> bool {
        *self.lock()
    }

    /// Blocks until open or until `timeout`. Returns whether it opened.
    pub fn wait(&self, timeout: Duration) -> bool {
        let open = self.lock();
        let (open, _) = self.opened
            .wait_timeout_while(open, timeout, |o| !*o)
            .unwrap_or_else(PoisonError::into_inner);
        *open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn wait_times_out_while_closed() {
        let latch = ExitLatch::new();
        let start = Instant::now();
        assert!(!latch.wait(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn opens_exactly_once() {
        let latch = ExitLatch::new();
        assert!(latch.open());
        assert!(!latch.open());
        assert!(latch.is_open());
        assert!(latch.wait(Duration::ZERO));
    }

    #[test]
    fn open_from_another_thread_releases_waiter() {
        let latch = Arc::new(ExitLatch::new());
        let opener = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                latch.open();
            })
        };
        assert!(latch.wait(Duration::from_secs(5)));
        opener.join().unwrap();
    }
}
