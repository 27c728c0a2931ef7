//! A single worker: one OS thread hosting its own single-threaded runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;

use futures_util::future::LocalBoxFuture;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::alloc::{self, MemoryMeter};
use crate::error::PoolError;
use crate::events::Tagged;

/// Work sent to a worker thread.
pub(crate) type Job<E> = Box<dyn FnOnce(WorkerContext<E>) -> LocalBoxFuture<'static, ()> + Send>;

pub(crate) struct Assignment<E> {
    pub job: Job<E>,
    pub context: WorkerContext<E>,
}

/// Tracks the usage a task reports against its ceiling.
#[derive(Debug)]
pub(crate) struct MemoryGuard {
    limit_bytes: u64,
    peak: AtomicU64,
    exceeded: AtomicBool,
    tripped: Notify,
}

impl MemoryGuard {
    pub fn new(limit_mb: u64) -> Self {
        Self {
            limit_bytes: limit_mb.saturating_mul(1024 * 1024),
            peak: AtomicU64::new(0),
            exceeded: AtomicBool::new(false),
            tripped: Notify::new(),
        }
    }

    /// Record usage; returns `false` once the ceiling is crossed.
    pub fn record(&self, bytes: u64) -> bool {
        self.peak.fetch_max(bytes, Ordering::SeqCst);
        if bytes > self.limit_bytes && !self.exceeded.swap(true, Ordering::SeqCst) {
            self.tripped.notify_one();
        }
        !self.is_exceeded()
    }

    pub fn is_exceeded(&self) -> bool {
        self.exceeded.load(Ordering::SeqCst)
    }

    pub async fn exceeded(&self) {
        self.tripped.notified().await;
    }

    pub fn limit_mb(&self) -> u64 {
        self.limit_bytes / 1024 / 1024
    }

    pub fn peak_mb(&self) -> u64 {
        self.peak.load(Ordering::SeqCst) / 1024 / 1024
    }
}

/// Handed to a task so it can talk back to the pool.
pub struct WorkerContext<E> {
    worker_id: usize,
    run_id: String,
    events: mpsc::UnboundedSender<Tagged<E>>,
    memory: Arc<MemoryGuard>,
    cancel: CancellationToken,
}

impl<E> Clone for WorkerContext<E> {
    fn clone(&self) -> Self {
        Self {
            worker_id: self.worker_id,
            run_id: self.run_id.clone(),
            events: self.events.clone(),
            memory: Arc::clone(&self.memory),
            cancel: self.cancel.clone(),
        }
    }
}

impl<E> WorkerContext<E> {
    pub(crate) fn new(
        worker_id: usize,
        run_id: String,
        events: mpsc::UnboundedSender<Tagged<E>>,
        memory: Arc<MemoryGuard>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            run_id,
            events,
            memory,
            cancel,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Printable id of the thread running the task.
    pub fn thread_id(&self) -> String {
        format!("worker-{}", self.worker_id)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Send an event on the pool's outward stream, tagged with this run.
    pub fn emit(&self, event: E) {
        let tagged = Tagged {
            run_id: self.run_id.clone(),
            event,
        };
        if self.events.send(tagged).is_err() {
            debug!(run_id = %self.run_id, worker_id = self.worker_id, "event stream closed, event dropped");
        }
    }

    /// Fires when the pool gives up on the task. The task's future is
    /// dropped at its next suspension point.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Report memory attributable to the task, in bytes.
    ///
    /// Returns `false` when the task is over its ceiling; the pool will fail
    /// the dispatch and retire this worker.
    pub fn record_memory(&self, bytes: u64) -> bool {
        self.memory.record(bytes)
    }
}

pub(crate) struct Worker<E> {
    pub id: usize,
    sender: std_mpsc::Sender<Assignment<E>>,
    meter: Arc<MemoryMeter>,
    _handle: JoinHandle<()>,
}

impl<E: Send + 'static> Worker<E> {
    pub fn spawn(id: usize) -> Result<Self, PoolError> {
        let (sender, receiver) = std_mpsc::channel::<Assignment<E>>();
        let meter = Arc::new(MemoryMeter::new());
        let thread_meter = Arc::clone(&meter);
        let handle = std::thread::Builder::new()
            .name(format!("relay-worker-{id}"))
            .spawn(move || worker_main(id, receiver, thread_meter))
            .map_err(|e| PoolError::Spawn(e.to_string()))?;
        debug!(worker_id = id, "worker started");
        Ok(Self {
            id,
            sender,
            meter,
            _handle: handle,
        })
    }

    /// Heap usage of the task this worker is running.
    pub fn meter(&self) -> &Arc<MemoryMeter> {
        &self.meter
    }

    pub fn assign(&self, assignment: Assignment<E>) -> Result<(), PoolError> {
        self.sender
            .send(assignment)
            .map_err(|_| PoolError::WorkerLost(self.id))
    }
}

fn worker_main<E>(id: usize, receiver: std_mpsc::Receiver<Assignment<E>>, meter: Arc<MemoryMeter>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker_id = id, error = %e, "failed to build worker runtime");
            return;
        }
    };

    let _scope = alloc::attach(Arc::clone(&meter));

    // Exits once the pool drops its sender.
    while let Ok(Assignment { job, context }) = receiver.recv() {
        meter.reset();
        let cancel = context.cancellation();
        let run_id = context.run_id().to_string();
        runtime.block_on(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(worker_id = id, run_id = %run_id, "task cancelled");
                }
                _ = job(context) => {}
            }
        });
    }
    debug!(worker_id = id, "worker exited");
}
