// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use canonical_error::CanonicalError;
use log::debug;

use crate::errors::session_busy_error;

/// Gates capture-session mutations. The token is "safe" when no mutation is
/// in flight; a mutation flips it unsafe until the session reports Active
/// again (or goes away). At most one mutation may be pending: a second
/// mark_unsafe() fails with SessionBusy instead of interleaving.
pub struct SessionSafetyBarrier {
    // Name of the pending mutation; None when safe.
    pending: Mutex<Option<&'static str>>,
    safe_again: Condvar,
}

impl Default for SessionSafetyBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSafetyBarrier {
    pub fn new() -> Self {
        SessionSafetyBarrier{pending: Mutex::new(None), safe_again: Condvar::new()}
    }

    fn lock(&self) -> MutexGuard<'_, Option<&'static str>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_safe(&self) -> bool {
        self.lock().is_none()
    }

    /// The mutation currently holding the token, if any.
    pub fn pending_mutation(&self) -> Option<&'static str> {
        *self.lock()
    }

    /// Claims the token for `mutation`. Fails fast with SessionBusy if another
    /// mutation holds it.
    pub fn mark_unsafe(&self, mutation: &'static str) -> Result<(), CanonicalError> {
        let mut pending = self.lock();
        if let Some(other) = *pending {
            return Err(session_busy_error(
                format!("cannot start {} while {} is pending", mutation, other).as_str()));
        }
        debug!("Session mutation {} started", mutation);
        *pending = Some(mutation);
        Ok(())
    }

    /// Releases the token and wakes every waiter.
    pub fn mark_safe(&self) {
        let mut pending = self.lock();
        if let Some(mutation) = pending.take() {
            debug!("Session mutation {} settled", mutation);
        }
        // Notify while holding the lock so no waiter can miss it.
        self.safe_again.notify_all();
    }

    /// Blocks until the token is safe. Returns immediately if it already is;
    /// fails with SessionBusy if `timeout` passes first.
    pub fn wait_until_safe(&self, timeout: Duration) -> Result<(), CanonicalError> {
        let pending = self.lock();
        let (pending, result) = self.safe_again
            .wait_timeout_while(pending, timeout, |p| p.is_some())
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() {
            if let Some(mutation) = *pending {
                return Err(session_busy_error(
                    format!("{} still pending after {:?}", mutation, timeout).as_str()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;
    use canonical_error::CanonicalErrorCode;

    #[test]
    fn wait_returns_immediately_when_safe() {
        let barrier = SessionSafetyBarrier::new();
        let start = Instant::now();
        barrier.wait_until_safe(Duration::from_secs(5)).unwrap();
        barrier.wait_until_safe(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_times_out_with_session_busy() {
        let barrier = SessionSafetyBarrier::new();
        barrier.mark_unsafe("configure").unwrap();
        let start = Instant::now();
        let err = barrier.wait_until_safe(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::Unavailable));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(barrier.pending_mutation(), Some("configure"));
    }

    #[test]
    fn second_mutation_fails_fast() {
        let barrier = SessionSafetyBarrier::new();
        barrier.mark_unsafe("configure").unwrap();
        let err = barrier.mark_unsafe("reconfigure").unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::Unavailable));
        barrier.mark_safe();
        barrier.mark_unsafe("reconfigure").unwrap();
    }

    #[test]
    fn wait_does_not_return_before_mark_safe() {
        let barrier = Arc::new(SessionSafetyBarrier::new());
        barrier.mark_unsafe("configure").unwrap();
        let released = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let barrier = Arc::clone(&barrier);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                barrier.wait_until_safe(Duration::from_secs(10)).unwrap();
                released.fetch_add(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(100));
        assert_eq!(released.load(Ordering::SeqCst), 0);
        barrier.mark_safe();
        waiter.join().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mark_safe_releases_every_parked_waiter() {
        const WAITERS: usize = 16;
        let barrier = Arc::new(SessionSafetyBarrier::new());
        barrier.mark_unsafe("configure").unwrap();
        let parked = Arc::new(std::sync::Barrier::new(WAITERS + 1));
        let waiters: Vec<_> = (0..WAITERS).map(|_| {
            let barrier = Arc::clone(&barrier);
            let parked = Arc::clone(&parked);
            thread::spawn(move || {
                parked.wait();
                barrier.wait_until_safe(Duration::from_secs(5))
            })
        }).collect();
        parked.wait();
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        barrier.mark_safe();
        for w in waiters {
            assert!(w.join().unwrap().is_ok());
        }
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
