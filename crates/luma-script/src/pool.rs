//! Bounded worker pool for script dispatch
//!
//! A fixed set of workers pulls `(artifact, event)` tasks off a bounded
//! queue. `submit` never blocks the producer: when the queue is full or
//! the pool is stopping, the task is dropped with a warning. This system
//! tolerates losing scripts under pressure to protect the tick loop and
//! the bus reader.

use crate::{ScriptError, ScriptExecutor};
use luma_core::Event;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// One unit of work: run `artifact` against `event`.
#[derive(Debug, Clone)]
pub struct Task {
    pub artifact: PathBuf,
    pub event: Event,
}

/// The worker pool.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` workers over a queue of `queue_size` tasks.
    pub fn start(executor: ScriptExecutor, workers: usize, queue_size: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let executor = executor.clone();
                tokio::spawn(worker_loop(worker, rx, executor))
            })
            .collect();

        debug!(workers, queue_size, "Worker pool started");
        Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        })
    }

    /// Queue a task without blocking. Full queue or stopped pool drops
    /// the task.
    pub fn submit(&self, task: Task) {
        let sender = self.sender.lock().unwrap();
        let Some(tx) = sender.as_ref() else {
            warn!("Worker pool is stopped, task rejected");
            return;
        };
        match tx.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(artifact = %task.artifact.display(), "Task queue full, dropping task");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Worker pool is stopped, task rejected");
            }
        }
    }

    /// Close the queue, let workers drain the remaining tasks, and join
    /// them.
    pub async fn stop(&self) {
        let sender = self.sender.lock().unwrap().take();
        drop(sender);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        debug!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    executor: ScriptExecutor,
) {
    loop {
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else {
            debug!(worker, "Task queue closed");
            break;
        };

        let artifact = task.artifact.clone();
        debug!(worker, artifact = %artifact.display(), "Executing script");

        let executor = executor.clone();
        let result =
            tokio::task::spawn_blocking(move || executor.execute(&task.artifact, &task.event))
                .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(ScriptError::MissingArtifact { path })) => {
                debug!(worker, artifact = %path.display(), "Artifact vanished before execution");
            }
            Ok(Err(e)) => {
                error!(worker, artifact = %artifact.display(), error = %e, "Script failed");
            }
            Err(e) => {
                error!(worker, artifact = %artifact.display(), error = %e, "Script task panicked");
            }
        }
    }
}
