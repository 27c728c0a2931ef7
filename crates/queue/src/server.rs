//! The worker server: joins the queue, claims runs, executes and reports
//! them until told to stop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use engine::Resolvers;
use pool::{RunOptions, RuntimeEngine};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

use crate::channel::{self, ChannelError, Socket};
use crate::convert::convert_run;
use crate::phoenix::PhoenixSocket;
use crate::protocol::{run_topic, ClaimedRun, RunDescriptor, GET_PLAN, WORKER_QUEUE};
use crate::reporter::{execute_run, ReportOptions};
use crate::resolvers::ChannelResolvers;
use crate::workloop::{run_workloop, RunLauncher, WorkloopConfig};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: ChannelError,
    },

    #[error("failed to join {topic}: {source}")]
    Join {
        topic: String,
        #[source]
        source: ChannelError,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base websocket URL of the queue, e.g. `ws://localhost:4000/worker`.
    pub lightning_url: String,
    /// Runs executed at once.
    pub capacity: usize,
    pub workloop: WorkloopConfig,
    /// Budget for each run unless the run sets its own.
    pub run_timeout: Option<Duration>,
    pub job_timeout: Option<Duration>,
    pub memory_limit_mb: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lightning_url: "ws://localhost:4000/worker".to_string(),
            capacity: 5,
            workloop: WorkloopConfig::default(),
            run_timeout: None,
            job_timeout: None,
            memory_limit_mb: None,
        }
    }
}

/// Claims runs from the queue and executes them on a [`RuntimeEngine`].
pub struct WorkerServer {
    socket: Arc<dyn Socket>,
    engine: RuntimeEngine,
    config: WorkerConfig,
    launcher: Arc<Launcher>,
    cancel: CancellationToken,
}

impl WorkerServer {
    pub fn new(socket: Arc<dyn Socket>, engine: RuntimeEngine, config: WorkerConfig) -> Self {
        let launcher = Arc::new(Launcher {
            socket: Arc::clone(&socket),
            engine: engine.clone(),
            defaults: config.clone(),
            active: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
        });
        Self {
            socket,
            engine,
            config,
            launcher,
            cancel: CancellationToken::new(),
        }
    }

    /// Open a websocket to `config.lightning_url` and build a server on it.
    pub async fn connect(config: WorkerConfig, engine: RuntimeEngine) -> Result<Self, WorkerError> {
        let socket = PhoenixSocket::connect(&config.lightning_url)
            .await
            .map_err(|source| WorkerError::Connect {
                url: config.lightning_url.clone(),
                source,
            })?;
        Ok(Self::new(Arc::new(socket), engine, config))
    }

    /// Cancelling this token stops the claim loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ids of the runs currently being executed.
    pub fn active_runs(&self) -> Vec<String> {
        self.launcher.lock_active().iter().cloned().collect()
    }

    /// Join the queue and claim work until shut down, then wait for claimed
    /// runs to finish reporting.
    #[instrument(skip_all, fields(capacity = self.config.capacity))]
    pub async fn run(&self) -> Result<(), WorkerError> {
        let queue = self
            .socket
            .join(WORKER_QUEUE, json!({}))
            .await
            .map_err(|source| WorkerError::Join {
                topic: WORKER_QUEUE.to_string(),
                source,
            })?;
        info!("joined queue, waiting for work");

        let launcher: Arc<dyn RunLauncher> = self.launcher.clone();
        run_workloop(queue, launcher, self.config.workloop, self.cancel.clone()).await;

        let in_flight = self.launcher.lock_active().len();
        if in_flight > 0 {
            info!(in_flight, "waiting for claimed runs to finish");
        }
        self.launcher.tracker.close();
        self.launcher.tracker.wait().await;
        Ok(())
    }

    /// Stop claiming, let claimed runs finish, then stop the engine.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.launcher.tracker.close();
        self.launcher.tracker.wait().await;
        self.engine.destroy(false).await;
    }
}

struct Launcher {
    socket: Arc<dyn Socket>,
    engine: RuntimeEngine,
    defaults: WorkerConfig,
    /// Claimed runs whose `workflow:complete` has not been acknowledged yet.
    active: Arc<Mutex<HashSet<String>>>,
    tracker: TaskTracker,
}

impl Launcher {
    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RunLauncher for Launcher {
    fn free_capacity(&self) -> usize {
        self.defaults.capacity.saturating_sub(self.lock_active().len())
    }

    async fn launch(&self, run: ClaimedRun) {
        if !self.lock_active().insert(run.id.clone()) {
            warn!(run_id = %run.id, "run already in progress, ignoring duplicate claim");
            return;
        }
        let socket = Arc::clone(&self.socket);
        let engine = self.engine.clone();
        let defaults = self.defaults.clone();
        let active = Arc::clone(&self.active);
        self.tracker.spawn(async move {
            let run_id = run.id.clone();
            if let Err(e) = start_run(socket.as_ref(), &engine, run, &defaults).await {
                error!(run_id = %run_id, error = %e, "run could not be started");
            }
            active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&run_id);
        });
    }
}

/// Join the run's channel, fetch and convert its plan, then execute and
/// report it.
#[instrument(skip_all, fields(run_id = %claimed.id))]
async fn start_run(
    socket: &dyn Socket,
    engine: &RuntimeEngine,
    claimed: ClaimedRun,
    defaults: &WorkerConfig,
) -> Result<(), ChannelError> {
    let channel = socket
        .join(&run_topic(&claimed.id), json!({ "token": claimed.token }))
        .await?;
    let descriptor: RunDescriptor = channel::request(channel.as_ref(), GET_PLAN, &json!({})).await?;
    let (plan, settings) = convert_run(descriptor);
    info!(jobs = plan.jobs.len(), "run plan received");

    let resolvers: Arc<dyn Resolvers> = Arc::new(ChannelResolvers::new(Arc::clone(&channel)));
    let options = RunOptions {
        timeout: settings
            .run_timeout_ms
            .map(Duration::from_millis)
            .or(defaults.run_timeout),
        memory_limit_mb: settings.memory_limit_mb.or(defaults.memory_limit_mb),
        job_timeout: settings
            .job_timeout_ms
            .map(Duration::from_millis)
            .or(defaults.job_timeout),
        resolvers: Some(resolvers),
    };
    let report = ReportOptions {
        output_dataclips: settings.output_dataclips.unwrap_or(true),
    };

    let exit = execute_run(engine, Arc::clone(&channel), plan, options, report).await;
    info!(reason = ?exit.reason, "run reported");

    if let Err(e) = channel.leave().await {
        warn!(error = %e, "failed to leave run channel");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockChannel, MockSocket};
    use crate::protocol::{CLAIM, GET_DATACLIP, RUN_COMPLETE, STEP_COMPLETE, STEP_START};
    use pool::{EngineConfig, PoolConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> RuntimeEngine {
        RuntimeEngine::new(EngineConfig {
            pool: PoolConfig {
                max_workers: 2,
                ..PoolConfig::default()
            },
            ..EngineConfig::default()
        })
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            capacity: 2,
            workloop: WorkloopConfig {
                backoff_min: Duration::from_millis(5),
                backoff_max: Duration::from_millis(5),
            },
            ..WorkerConfig::default()
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn claims_executes_and_reports_a_run() {
        let socket = Arc::new(MockSocket::new());
        let claims = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&claims);
        socket.add(MockChannel::new(WORKER_QUEUE).on(CLAIM, move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(json!({ "runs": [{ "id": "r1", "token": "tok" }] }))
            } else {
                Ok(json!({ "runs": [] }))
            }
        }));
        let run = socket.add(
            MockChannel::new("run:r1")
                .on(GET_PLAN, |_| {
                    Ok(json!({
                        "id": "r1",
                        "dataclip_id": "clip-0",
                        "triggers": [{ "id": "t" }],
                        "jobs": [{ "id": "a", "body": "{ data: { x: data.x * 2 } }" }],
                        "edges": [{ "source_trigger_id": "t", "target_job_id": "a" }]
                    }))
                })
                .on(GET_DATACLIP, |_| Ok(json!(r#"{"data":{"x":21}}"#))),
        );

        let server = Arc::new(WorkerServer::new(socket.clone(), engine(), config()));
        let running = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.run().await }
        });

        wait_for(|| run.has_left()).await;
        server.shutdown_token().cancel();
        running.await.unwrap().unwrap();

        assert_eq!(socket.joins()[1], ("run:r1".to_string(), json!({ "token": "tok" })));
        assert_eq!(
            run.events(),
            vec![GET_PLAN, GET_DATACLIP, STEP_START, STEP_COMPLETE, RUN_COMPLETE]
        );
        let start = &run.pushed(STEP_START)[0];
        assert_eq!(start["job_id"], "a");
        assert_eq!(start["input_dataclip_id"], "clip-0");

        let step = &run.pushed(STEP_COMPLETE)[0];
        let body: serde_json::Value =
            serde_json::from_str(step["output_dataclip"].as_str().unwrap()).unwrap();
        assert_eq!(body["data"]["x"].as_f64(), Some(42.0));
        assert_eq!(run.pushed(RUN_COMPLETE)[0]["reason"], "success");
        assert!(server.active_runs().is_empty());
    }

    #[tokio::test]
    async fn unjoinable_runs_are_released() {
        let socket = Arc::new(MockSocket::new());
        let claims = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&claims);
        socket.add(MockChannel::new(WORKER_QUEUE).on(CLAIM, move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(json!({ "runs": [{ "id": "ghost", "token": "tok" }] }))
            } else {
                Ok(json!({ "runs": [] }))
            }
        }));

        let server = Arc::new(WorkerServer::new(socket.clone(), engine(), config()));
        let running = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.run().await }
        });

        wait_for(|| claims.load(Ordering::SeqCst) > 2).await;
        server.shutdown_token().cancel();
        running.await.unwrap().unwrap();

        assert!(server.active_runs().is_empty());
    }

    #[tokio::test]
    async fn run_fails_when_the_queue_cannot_be_joined() {
        let server = WorkerServer::new(Arc::new(MockSocket::new()), engine(), config());
        assert!(matches!(server.run().await, Err(WorkerError::Join { .. })));
    }
}
