//! Bounded pool of isolated compute threads.
//!
//! Each worker owns a command channel and talks back only through the reply
//! channel handed to it with every job. No task state is shared with the
//! coordinating side apart from the cancellation signal.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::task::TaskId;

/// A payload handed to a worker.
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub task_id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
}

/// Messages a worker sends back for one job.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Progress(serde_json::Value),
    Done(serde_json::Value),
    Error(String),
}

/// What a handler can do while running a job.
pub struct WorkerScope {
    replies: mpsc::UnboundedSender<WorkerMessage>,
    cancel: CancellationToken,
}

impl WorkerScope {
    /// Report progress; relayed onto the event bus by the bridge.
    pub fn progress(&self, progress: serde_json::Value) {
        let _ = self.replies.send(WorkerMessage::Progress(progress));
    }

    /// Set when the caller cancelled or timed out. Handlers should poll this
    /// between chunks of work.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// CPU-bound code that runs on the worker threads.
pub trait WorkerHandler: Send + Sync + 'static {
    fn handle(&self, job: &WorkerJob, scope: &WorkerScope) -> anyhow::Result<serde_json::Value>;
}

enum WorkerCommand {
    Run {
        job: WorkerJob,
        cancel: CancellationToken,
        replies: mpsc::UnboundedSender<WorkerMessage>,
    },
    Shutdown,
}

struct WorkerSlot {
    index: usize,
    commands: std_mpsc::Sender<WorkerCommand>,
    in_flight: Arc<AtomicUsize>,
    alive: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Fixed-size set of worker threads.
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
}

impl WorkerPool {
    /// Start `size` worker threads sharing one handler.
    pub fn spawn(size: usize, handler: Arc<dyn WorkerHandler>) -> std::io::Result<Self> {
        let mut slots = Vec::with_capacity(size);
        for index in 0..size {
            let (tx, rx) = std_mpsc::channel::<WorkerCommand>();
            let in_flight = Arc::new(AtomicUsize::new(0));
            let alive = Arc::new(AtomicBool::new(true));
            let thread = std::thread::Builder::new()
                .name(format!("taskcore-worker-{index}"))
                .spawn({
                    let handler = Arc::clone(&handler);
                    let in_flight = Arc::clone(&in_flight);
                    let alive = Arc::clone(&alive);
                    move || worker_loop(index, rx, handler, in_flight, alive)
                })?;
            slots.push(WorkerSlot {
                index,
                commands: tx,
                in_flight,
                alive,
                thread: Mutex::new(Some(thread)),
            });
        }
        info!(size, "Worker pool started");
        Ok(Self { slots })
    }

    /// Configured number of workers.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Workers still accepting jobs.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.alive.load(Ordering::Acquire))
            .count()
    }

    /// Jobs currently assigned to each worker.
    pub fn loads(&self) -> Vec<usize> {
        self.slots
            .iter()
            .map(|s| s.in_flight.load(Ordering::Acquire))
            .collect()
    }

    /// Send a job to the least-loaded live worker (lowest index on ties).
    /// Returns the chosen index and its reply channel, or `None` when no
    /// worker can take it.
    pub(crate) fn dispatch(
        &self,
        job: WorkerJob,
        cancel: CancellationToken,
    ) -> Option<(usize, mpsc::UnboundedReceiver<WorkerMessage>)> {
        let mut candidates: Vec<&WorkerSlot> = self
            .slots
            .iter()
            .filter(|s| s.alive.load(Ordering::Acquire))
            .collect();
        candidates.sort_by_key(|s| (s.in_flight.load(Ordering::Acquire), s.index));

        for slot in candidates {
            let (replies, rx) = mpsc::unbounded_channel();
            slot.in_flight.fetch_add(1, Ordering::AcqRel);
            let command = WorkerCommand::Run {
                job: job.clone(),
                cancel: cancel.clone(),
                replies,
            };
            match slot.commands.send(command) {
                Ok(()) => {
                    debug!(worker = slot.index, task_id = %job.task_id, "Dispatched job to worker");
                    return Some((slot.index, rx));
                }
                Err(_) => {
                    slot.in_flight.fetch_sub(1, Ordering::AcqRel);
                    slot.alive.store(false, Ordering::Release);
                    warn!(worker = slot.index, "Worker channel closed, marking dead");
                }
            }
        }
        None
    }

    /// Stop every worker and wait for the threads to exit.
    pub fn shutdown(&self) {
        for slot in &self.slots {
            let _ = slot.commands.send(WorkerCommand::Shutdown);
        }
        for slot in &self.slots {
            let handle = slot
                .thread
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(handle) = handle
                && handle.join().is_err()
            {
                warn!(worker = slot.index, "Worker thread panicked during shutdown");
            }
            slot.alive.store(false, Ordering::Release);
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for slot in &self.slots {
            let _ = slot.commands.send(WorkerCommand::Shutdown);
        }
    }
}

fn worker_loop(
    index: usize,
    commands: std_mpsc::Receiver<WorkerCommand>,
    handler: Arc<dyn WorkerHandler>,
    in_flight: Arc<AtomicUsize>,
    alive: Arc<AtomicBool>,
) {
    while let Ok(command) = commands.recv() {
        let (job, cancel, replies) = match command {
            WorkerCommand::Run {
                job,
                cancel,
                replies,
            } => (job, cancel, replies),
            WorkerCommand::Shutdown => break,
        };

        let message = if cancel.is_cancelled() {
            WorkerMessage::Error("cancelled before start".to_string())
        } else {
            let scope = WorkerScope {
                replies: replies.clone(),
                cancel,
            };
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&job, &scope))) {
                Ok(Ok(value)) => WorkerMessage::Done(value),
                Ok(Err(e)) => WorkerMessage::Error(format!("{e:#}")),
                Err(_) => WorkerMessage::Error("worker handler panicked".to_string()),
            }
        };
        in_flight.fetch_sub(1, Ordering::AcqRel);
        // The caller may have given up already.
        let _ = replies.send(message);
    }
    alive.store(false, Ordering::Release);
    debug!(worker = index, "Worker thread exiting");
}
