// Worker pool for background lease work.
//
// A fixed set of tokio tasks pulls boxed futures off a shared queue. Shutting
// the pool down closes the queue. Workers finish whatever was already queued
// and the caller waits for them up to a grace period. Work still running
// after that is aborted. A task that panics is logged and its worker moves on
// to the next one.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Task = BoxFuture<'static, ()>;

#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    queue: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `workers` worker tasks on the current tokio runtime
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let pool = name.clone();
                tokio::spawn(async move {
                    loop {
                        // Only one idle worker waits on the queue at a time
                        let task = rx.lock().await.recv().await;
                        let Some(task) = task else {
                            break;
                        };
                        if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                            error!(
                                pool = %pool,
                                worker_id,
                                panic = panic_message(panic.as_ref()),
                                "task panicked"
                            );
                        }
                    }
                    debug!(pool = %pool, worker_id, "worker exiting");
                })
            })
            .collect();

        debug!(pool = %name, workers, "started worker pool");
        Self {
            name,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Queues `task`. Returns false once the pool is shut down.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let queue = self.queue.lock();
        match queue.as_ref() {
            Some(tx) => tx.send(task.boxed()).is_ok(),
            None => {
                debug!(pool = %self.name, "rejecting task submitted after shutdown");
                false
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.queue.lock().is_none()
    }

    /// Stops accepting work and waits up to `grace` for queued work to finish.
    ///
    /// Returns true if every worker exited in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.queue.lock().take();
        let mut workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return true;
        }

        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let drain = async {
            for worker in workers.iter_mut() {
                if let Err(e) = worker.await {
                    if e.is_panic() {
                        error!(pool = %self.name, error = %e, "worker panicked");
                    }
                }
            }
        };

        match tokio::time::timeout(grace, drain).await {
            Ok(()) => {
                info!(pool = %self.name, "worker pool drained");
                true
            }
            Err(_) => {
                warn!(pool = %self.name, ?grace, "worker pool did not drain in time, abandoning tasks");
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
