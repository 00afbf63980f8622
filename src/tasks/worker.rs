//! Worker pools: one pool per queue, popping tasks and dispatching them
//! through the registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::queue::{self, Queue, TaskEnvelope};
use crate::runtime::Runtime;

pub struct WorkerPool {
    queue: Queue,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers popping the queue.
    pub fn start(rt: Arc<Runtime>, queue: Queue, size: usize) -> WorkerPool {
        let (shutdown, _) = watch::channel(false);

        let workers = (0..size)
            .map(|n| {
                let rt = rt.clone();
                let mut shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move {
                    info!(queue = %queue, worker = n, "worker started");
                    worker_loop(rt, queue, &mut shutdown_rx).await;
                    info!(queue = %queue, worker = n, "worker stopped");
                })
            })
            .collect();

        info!(queue = %queue, size, "worker pool started");
        WorkerPool { queue, shutdown, workers }
    }

    /// Signals every worker and waits for in-flight tasks to finish.
    pub async fn stop(self) {
        info!(queue = %self.queue, "stopping worker pool");
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(rt: Arc<Runtime>, queue: Queue, shutdown: &mut watch::Receiver<bool>) {
    let poll_interval = Duration::from_secs(rt.config.worker_poll_interval.max(1));

    loop {
        if *shutdown.borrow() {
            return;
        }

        match queue::pop(&rt.db, queue).await {
            Ok(Some(envelope)) => {
                perform_task(&rt, queue, envelope).await;
            }
            Ok(None) => {
                // nothing queued; doze until the next poll or shutdown
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(err) => {
                warn!(queue = %queue, error = %err, "error popping task");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

/// Decodes and runs one task under its timeout, recovering from panics so
/// a bad task never takes the worker down.
async fn perform_task(rt: &Arc<Runtime>, queue: Queue, envelope: TaskEnvelope) {
    let started = Instant::now();
    let org_id = envelope.org_id;
    let kind = envelope.kind.clone();

    let task = match rt.tasks.decode(&envelope) {
        Ok(task) => task,
        Err(err) => {
            error!(task = %kind, org_id, error = %err, "error decoding task");
            rt.stats.tasks_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let _ = queue::done(&rt.db, queue, org_id, started.elapsed().as_millis() as i64).await;
            return;
        }
    };

    let timeout = task.timeout();
    let task_rt = rt.clone();
    // run on its own tokio task so a panic surfaces as a join error
    // instead of unwinding the worker
    let outcome = tokio::time::timeout(
        timeout,
        tokio::spawn(async move { task.perform(task_rt, org_id).await }),
    )
    .await;

    match outcome {
        Ok(Ok(Ok(()))) => {
            rt.stats.tasks_completed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            info!(
                task = %kind,
                org_id,
                elapsed_ms = started.elapsed().as_millis() as i64,
                "task complete"
            );
        }
        Ok(Ok(Err(err))) => {
            rt.stats.tasks_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            error!(task = %kind, org_id, error = %err, "error running task");
        }
        Ok(Err(join_err)) => {
            rt.stats.tasks_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if join_err.is_panic() {
                error!(task = %kind, org_id, "task panicked");
            } else {
                error!(task = %kind, org_id, "task cancelled");
            }
        }
        Err(_) => {
            rt.stats.tasks_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            error!(task = %kind, org_id, timeout_secs = timeout.as_secs(), "task timed out");
        }
    }

    let _ = queue::done(&rt.db, queue, org_id, started.elapsed().as_millis() as i64).await;
}
