// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! A single dedicated worker thread on which every hardware callback and every
//! device/session state transition runs. Jobs run strictly in the order they
//! were posted.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use canonical_error::{CanonicalError, internal_error, unavailable_error};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    // Everything queued ahead of Stop still runs.
    Stop,
}

/// Cloneable posting end of a running worker. Handles outlive the worker;
/// posting after the worker stopped fails with Unavailable.
#[derive(Clone)]
pub struct ExecutorHandle {
    sender: mpsc::UnboundedSender<Command>,
    worker_thread: ThreadId,
}

impl ExecutorHandle {
    pub fn post<F>(&self, job: F) -> Result<(), CanonicalError>
    where F: FnOnce() + Send + 'static
    {
        match self.sender.send(Command::Run(Box::new(job))) {
            Ok(()) => Ok(()),
            Err(_) => Err(unavailable_error("background worker is not running")),
        }
    }

    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_thread
    }
}

struct Worker {
    handle: ExecutorHandle,
    thread: JoinHandle<()>,
}

pub struct BackgroundExecutor {
    name: String,
    worker: Mutex<Option<Worker>>,
}

impl BackgroundExecutor {
    pub fn new(name: &str) -> Self {
        BackgroundExecutor{name: name.to_string(), worker: Mutex::new(None)}
    }

    fn lock(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the worker. No-op if already running.
    pub fn start(&self) -> Result<(), CanonicalError> {
        let mut locked_worker = self.lock();
        if locked_worker.is_some() {
            return Ok(());
        }
        let (sender, mut receiver) = mpsc::unbounded_channel::<Command>();
        let thread = match thread::Builder::new().name(self.name.clone()).spawn(move || {
            while let Some(command) = receiver.blocking_recv() {
                match command {
                    Command::Run(job) => job(),
                    Command::Stop => break,
                }
            }
            // Dropping the receiver here makes later posts fail.
        }) {
            Ok(t) => t,
            Err(e) => return Err(internal_error(
                format!("Could not spawn worker {}: {}", self.name, e).as_str())),
        };
        let worker_thread = thread.thread().id();
        *locked_worker = Some(Worker{handle: ExecutorHandle{sender, worker_thread},
                                     thread});
        info!("Started background worker {}", self.name);
        Ok(())
    }

    /// Drains the jobs already queued, then joins the worker. No-op if not
    /// running.
    pub fn stop(&self) {
        let worker = match self.lock().take() {
            Some(w) => w,
            None => return,
        };
        if worker.handle.is_worker_thread() {
            // Joining ourselves would hang; let the loop exit on its own.
            error!("stop() called on worker {} from itself; not joining", self.name);
            let _ = worker.handle.sender.send(Command::Stop);
            return;
        }
        if worker.handle.sender.send(Command::Stop).is_err() {
            warn!("Worker {} already exited", self.name);
        }
        if worker.thread.join().is_err() {
            error!("Worker {} panicked", self.name);
        }
        info!("Stopped background worker {}", self.name);
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    pub fn handle(&self) -> Result<ExecutorHandle, CanonicalError> {
        match self.lock().as_ref() {
            Some(w) => Ok(w.handle.clone()),
            None => Err(unavailable_error(
                format!("Background worker {} is not running", self.name).as_str())),
        }
    }

    pub fn post<F>(&self, job: F) -> Result<(), CanonicalError>
    where F: FnOnce() + Send + 'static
    {
        self.handle()?.post(job)
    }

    /// Runs `f` on the worker and waits for its result. Runs inline when
    /// already on the worker.
    pub fn run_sync<T, F>(&self, f: F) -> Result<T, CanonicalError>
    where T: Send + 'static,
          F: FnOnce() -> T + Send + 'static
    {
        let handle = self.handle()?;
        if handle.is_worker_thread() {
            return Ok(f());
        }
        let (tx, rx) = oneshot::channel();
        handle.post(move || {
            let _ = tx.send(f());
        })?;
        match rx.blocking_recv() {
            Ok(v) => Ok(v),
            Err(_) => {
                debug!("Worker {} dropped a synchronous job", self.name);
                Err(unavailable_error("background worker stopped before replying"))
            }
        }
    }
}

impl Drop for BackgroundExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;
    use canonical_error::CanonicalErrorCode;

    #[test]
    fn start_and_stop_are_idempotent() {
        let executor = BackgroundExecutor::new("test-worker");
        executor.stop();
        executor.start().unwrap();
        executor.start().unwrap();
        assert!(executor.is_running());
        executor.stop();
        executor.stop();
        assert!(!executor.is_running());
        // Restartable.
        executor.start().unwrap();
        assert_eq!(executor.run_sync(|| 5).unwrap(), 5);
    }

    #[test]
    fn jobs_run_in_order_on_one_named_thread() {
        let executor = BackgroundExecutor::new("ordered-worker");
        executor.start().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = Arc::clone(&seen);
            executor.post(move || {
                let name = thread::current().name().map(str::to_string);
                seen.lock().unwrap().push((i, name));
            }).unwrap();
        }
        executor.stop();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 50);
        for (expected, (i, name)) in seen.iter().enumerate() {
            assert_eq!(*i, expected);
            assert_eq!(name.as_deref(), Some("ordered-worker"));
        }
    }

    #[test]
    fn stop_drains_in_flight_jobs() {
        let executor = BackgroundExecutor::new("drain-worker");
        executor.start().unwrap();
        let (tx, rx) = std_mpsc::channel();
        executor.post(move || {
            thread::sleep(Duration::from_millis(100));
            tx.send("done").unwrap();
        }).unwrap();
        executor.stop();
        // The slow job finished before stop() returned.
        assert_eq!(rx.try_recv().unwrap(), "done");
    }

    #[test]
    fn posting_after_stop_fails() {
        let executor = BackgroundExecutor::new("stopped-worker");
        executor.start().unwrap();
        let handle = executor.handle().unwrap();
        executor.stop();
        let err = handle.post(|| {}).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::Unavailable));
        let err = executor.run_sync(|| 1).unwrap_err();
        assert!(matches!(err.code, CanonicalErrorCode::Unavailable));
    }

    #[test]
    fn run_sync_from_worker_runs_inline() {
        let executor = Arc::new(BackgroundExecutor::new("nested-worker"));
        executor.start().unwrap();
        let inner = Arc::clone(&executor);
        let v = executor.run_sync(move || inner.run_sync(|| 7).unwrap()).unwrap();
        assert_eq!(v, 7);
        executor.stop();
    }
}
