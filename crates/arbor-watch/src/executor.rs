//! Single-threaded callback executor.
//!
//! Watcher backends publish from their own threads; everything that mutates
//! the cache or invokes subscriber callbacks is funneled through one worker
//! draining a channel. That gives two guarantees for free: jobs run in
//! submission order, and no two callbacks ever run concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, ThreadId};

use arbor_core::observers::run_isolated;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct CallbackExecutor {
    tx: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Option<ThreadId>,
    closed: AtomicBool,
}

impl CallbackExecutor {
    pub(crate) fn new() -> CallbackExecutor {
        let (tx, rx) = unbounded::<Job>();
        let worker = std::thread::Builder::new()
            .name("arbor-callback".to_owned())
            .spawn(move || {
                for job in rx {
                    run_isolated("executor job", job);
                }
            });
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                // Constrained environments can refuse new threads. Fall back
                // to inline execution, which keeps ordering at the cost of
                // running callbacks on the submitting thread.
                tracing::warn!(
                    target = "arbor.watch",
                    error = %err,
                    "failed to spawn callback thread, running callbacks inline"
                );
                None
            }
        };
        let tx = worker.is_some().then_some(tx);
        let worker_id = worker.as_ref().map(|handle| handle.thread().id());
        CallbackExecutor {
            tx: Mutex::new(tx),
            worker: Mutex::new(worker),
            worker_id,
            closed: AtomicBool::new(false),
        }
    }

    /// Queues `job` behind everything already submitted. Jobs submitted after
    /// shutdown are dropped.
    pub(crate) fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(Box::new(job)).is_err() {
                    tracing::debug!(target = "arbor.watch", "callback channel closed, job dropped");
                }
            }
            None => run_isolated("executor job", job),
        }
    }

    /// Stops accepting jobs, drains what was already queued, and joins the
    /// worker. Idempotent and callable from any thread, including the worker
    /// itself (from inside a callback): in that case the join is skipped and
    /// the worker exits on its own once the queue drains.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender disconnects the channel once queued jobs drain.
        self.tx.lock().take();
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if self.worker_id == Some(std::thread::current().id()) {
            // Joining here would be the worker waiting on itself.
            return;
        }
        if handle.join().is_err() {
            tracing::error!(target = "arbor.watch", "callback thread panicked");
        }
    }
}

impl Drop for CallbackExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn jobs_run_in_submission_order() {
        let executor = CallbackExecutor::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let log = log.clone();
            executor.submit(move || log.lock().push(i));
        }
        executor.shutdown();
        assert_eq!(*log.lock(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_drains_queued_jobs_and_is_idempotent() {
        let executor = CallbackExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let ran = ran.clone();
            executor.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        executor.shutdown();
        executor.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 8);

        // Late submissions are dropped, not run.
        let ran2 = ran.clone();
        executor.submit(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn shutdown_from_the_worker_thread_does_not_deadlock() {
        let executor = Arc::new(CallbackExecutor::new());
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let inner = Arc::clone(&executor);
        executor.submit(move || {
            inner.shutdown();
            let _ = tx.send(());
        });
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        // A second shutdown from the outside is still a no-op.
        executor.shutdown();
    }

    #[test]
    fn a_panicking_job_does_not_kill_the_worker() {
        let executor = CallbackExecutor::new();
        executor.submit(|| panic!("job bug"));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        executor.submit(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        executor.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
