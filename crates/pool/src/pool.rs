//! The bounded worker pool.
//!
//! `WorkerPool::dispatch` is the only way work reaches a worker:
//! 1. Waits (FIFO) for one of `max_workers` permits.
//! 2. Takes an idle worker, or spawns one.
//! 3. Races the task against its wall-clock budget, its memory ceiling and
//!    pool shutdown. The worker's heap meter is sampled while the task runs.
//! 4. Returns the worker to the idle list on success. Otherwise cancels the
//!    task, so it runs no further, and retires the worker.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::alloc::MemoryMeter;
use crate::error::PoolError;
use crate::events::Tagged;
use crate::worker::{Assignment, Job, MemoryGuard, Worker, WorkerContext};

const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on concurrently running tasks.
    pub max_workers: usize,
    /// Wall-clock budget when a dispatch does not set one.
    pub default_timeout: Duration,
    /// Memory ceiling when a dispatch does not set one.
    pub default_memory_limit_mb: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            default_timeout: Duration::from_secs(10 * 60),
            default_memory_limit_mb: 500,
        }
    }
}

/// Per-dispatch overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    pub timeout: Option<Duration>,
    pub memory_limit_mb: Option<u64>,
}

pub struct WorkerPool<E> {
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Worker<E>>>,
    next_worker_id: AtomicUsize,
    events: mpsc::UnboundedSender<Tagged<E>>,
    shutdown: CancellationToken,
    in_flight: TaskTracker,
}

impl<E: Send + 'static> WorkerPool<E> {
    /// Build a pool and the receiving end of its outward event stream.
    pub fn new(config: PoolConfig) -> (Self, mpsc::UnboundedReceiver<Tagged<E>>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let max_workers = config.max_workers.max(1);
        let pool = Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            config: PoolConfig {
                max_workers,
                ..config
            },
            idle: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(1),
            events,
            shutdown: CancellationToken::new(),
            in_flight: TaskTracker::new(),
        };
        (pool, receiver)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.max_workers
    }

    /// Permits not currently held by a dispatch.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// A sender onto the outward stream, for events raised outside a task.
    pub fn emitter(&self) -> mpsc::UnboundedSender<Tagged<E>> {
        self.events.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.in_flight.is_closed()
    }

    /// Run `task` on a worker and return its output.
    ///
    /// The future `task` returns is built and polled on the worker's own
    /// thread, so it does not need to be `Send`.
    ///
    /// # Errors
    /// - [`PoolError::Timeout`] if the task outlives its budget.
    /// - [`PoolError::MemoryLimitExceeded`] if it reports usage over its ceiling.
    /// - [`PoolError::Shutdown`] if the pool is, or starts, shutting down.
    /// - [`PoolError::WorkerLost`] if the worker thread dies.
    pub async fn dispatch<F, Fut, T>(
        &self,
        run_id: &str,
        options: DispatchOptions,
        task: F,
    ) -> Result<T, PoolError>
    where
        F: FnOnce(WorkerContext<E>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        if self.in_flight.is_closed() {
            return Err(PoolError::Shutdown);
        }
        self.in_flight
            .track_future(self.run_on_worker(run_id, options, task))
            .await
    }

    async fn run_on_worker<F, Fut, T>(
        &self,
        run_id: &str,
        options: DispatchOptions,
        task: F,
    ) -> Result<T, PoolError>
    where
        F: FnOnce(WorkerContext<E>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| PoolError::Shutdown)?
            }
            _ = self.shutdown.cancelled() => return Err(PoolError::Shutdown),
        };

        let worker = self.checkout()?;
        let worker_id = worker.id;
        let meter = Arc::clone(worker.meter());
        meter.reset();
        let cancel = CancellationToken::new();
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let guard = Arc::new(MemoryGuard::new(
            options
                .memory_limit_mb
                .unwrap_or(self.config.default_memory_limit_mb),
        ));

        let (tx, rx) = oneshot::channel();
        let job: Job<E> = Box::new(move |ctx| {
            async move {
                let output = task(ctx).await;
                let _ = tx.send(output);
            }
            .boxed_local()
        });
        let context = WorkerContext::new(
            worker_id,
            run_id.to_string(),
            self.events.clone(),
            Arc::clone(&guard),
            cancel.clone(),
        );

        if let Err(err) = worker.assign(Assignment { job, context }) {
            self.retire(worker, &err);
            return Err(err);
        }
        debug!(run_id, worker_id, "task dispatched");

        let over_limit = || PoolError::MemoryLimitExceeded {
            limit_mb: guard.limit_mb(),
            used_mb: guard.peak_mb(),
        };

        let outcome = tokio::select! {
            biased;
            output = rx => output.map_err(|_| PoolError::WorkerLost(worker_id)),
            _ = guard.exceeded() => Err(over_limit()),
            _ = watch_memory(&meter, &guard) => Err(over_limit()),
            _ = tokio::time::sleep(timeout) => Err(PoolError::Timeout(timeout)),
            _ = self.shutdown.cancelled() => Err(PoolError::Shutdown),
        };
        // Catches spikes between samples.
        guard.record(meter.peak());
        let outcome = match outcome {
            Ok(_) if guard.is_exceeded() => Err(over_limit()),
            other => other,
        };

        match &outcome {
            Ok(_) => self.checkin(worker),
            Err(err) => {
                cancel.cancel();
                self.retire(worker, err);
            }
        }
        drop(permit);
        outcome
    }

    fn checkout(&self) -> Result<Worker<E>, PoolError> {
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match idle {
            Some(worker) => Ok(worker),
            None => Worker::spawn(self.next_worker_id.fetch_add(1, Ordering::SeqCst)),
        }
    }

    fn checkin(&self, worker: Worker<E>) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(worker);
    }

    /// Drop a worker for good. A replacement is spawned on next demand.
    fn retire(&self, worker: Worker<E>, reason: &PoolError) {
        warn!(worker_id = worker.id, error = %reason, "retiring worker");
        drop(worker);
    }

    /// Stop the pool.
    ///
    /// With `instant`, in-flight dispatches fail with `Shutdown`; otherwise
    /// they are allowed to finish first. Either way, later dispatches fail
    /// with `Shutdown`.
    pub async fn destroy(&self, instant: bool) {
        info!(instant, "destroying worker pool");
        self.in_flight.close();
        if instant {
            self.shutdown.cancel();
            self.permits.close();
        } else {
            self.in_flight.wait().await;
            self.permits.close();
            self.shutdown.cancel();
        }
        let idle = std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner));
        debug!(workers = idle.len(), "releasing idle workers");
    }
}

/// Feed the worker's heap meter into `guard` until the ceiling is crossed.
async fn watch_memory(meter: &MemoryMeter, guard: &MemoryGuard) {
    let mut tick = tokio::time::interval(MEMORY_SAMPLE_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    while guard.record(meter.peak()) {
        tick.tick().await;
    }
}
