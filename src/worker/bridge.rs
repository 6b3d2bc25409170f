//! Bridge between the coordinating side and the worker pool.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::WorkerError;
use crate::events::{Event, EventBus};
use crate::task::TaskId;
use crate::worker::pool::{WorkerJob, WorkerMessage, WorkerPool};

/// Offloads heavy task payloads onto the worker pool and awaits the answer
/// without blocking the coordinating thread.
pub struct WorkerBridge {
    pool: WorkerPool,
    bus: EventBus,
    call_timeout: Duration,
}

impl WorkerBridge {
    pub fn new(pool: WorkerPool, bus: EventBus, call_timeout: Duration) -> Self {
        Self {
            pool,
            bus,
            call_timeout,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run one payload on a worker.
    ///
    /// Resolves with the worker's result; rejects on a worker error, when
    /// `call_timeout` elapses, or when `cancel` fires (the worker is signalled
    /// in both of the latter cases). Fails immediately if no worker is alive.
    pub async fn execute_in_worker(
        &self,
        task_id: TaskId,
        task_type: &str,
        payload: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, WorkerError> {
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled { task_id });
        }

        let job = WorkerJob {
            task_id,
            task_type: task_type.to_string(),
            payload,
        };
        let worker_signal = cancel.child_token();
        let (worker, mut replies) = self
            .pool
            .dispatch(job, worker_signal.clone())
            .ok_or(WorkerError::Unavailable { task_id })?;

        let deadline = tokio::time::sleep(self.call_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    worker_signal.cancel();
                    debug!(task_id = %task_id, worker, "Worker call cancelled");
                    return Err(WorkerError::Cancelled { task_id });
                }
                _ = &mut deadline => {
                    worker_signal.cancel();
                    let err = WorkerError::Timeout { task_id, timeout: self.call_timeout };
                    warn!(task_id = %task_id, worker, "Worker call timed out");
                    self.bus.emit(Event::WorkerError { task_id, error: err.to_string() });
                    return Err(err);
                }
                message = replies.recv() => match message {
                    Some(WorkerMessage::Progress(progress)) => {
                        self.bus.emit(Event::TaskProgress { task_id, progress });
                    }
                    Some(WorkerMessage::Done(result)) => {
                        self.bus.emit(Event::WorkerResult { task_id, result: result.clone() });
                        return Ok(result);
                    }
                    Some(WorkerMessage::Error(message)) => {
                        self.bus.emit(Event::WorkerError { task_id, error: message.clone() });
                        return Err(WorkerError::Failed { task_id, message });
                    }
                    None => {
                        let message = "worker exited without replying".to_string();
                        self.bus.emit(Event::WorkerError { task_id, error: message.clone() });
                        return Err(WorkerError::Failed { task_id, message });
                    }
                },
            }
        }
    }

    /// Stop the pool and join its threads.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

impl std::fmt::Debug for WorkerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBridge")
            .field("workers", &self.pool.size())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}
