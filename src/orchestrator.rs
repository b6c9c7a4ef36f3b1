//! Top-level coordination of a test plan across a device pool.
//!
//! [`Orchestrator::execute_test_plan`] drives the whole run: it reserves
//! devices (never more than the concurrency cap), spawns a
//! [`Worker`](crate::worker::Worker) per reservation, and supervises the
//! workers. Reservation happens *before* spawning, so a device is in hand
//! for every worker task that exists. The first worker-fatal failure
//! aborts the remaining workers; suite-level failures stay inside the
//! workers and never reach this layer.
//!
//! The plan stops producing new workers as soon as any worker observes
//! the end of the suite stream, and an optional overall timeout bounds
//! the whole run. Files staged device-wide for the plan are swept off
//! every device on the way out, whatever the exit path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Harness;
use crate::control::{ControlCommandHandler, DeviceChangeListener, DeviceRestoration};
use crate::device::{Device, DeviceHandle};
use crate::logcat::TagHandler;
use crate::pool::{DevicePool, Reservation};
use crate::reporting::{RunStats, StatsSnapshot, TestRunListener};
use crate::storage::DeviceStorage;
use crate::suite::SuiteStream;
use crate::worker::{Worker, WorkerError};

/// Wiring for the on-device control protocol, applied per worker.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Log tag the control service publishes commands under.
    pub tag: String,
    /// Package of the on-device control service.
    pub service_package: String,
    /// Package of the application under test (grant target).
    pub app_package: String,
}

impl ControlConfig {
    /// Wiring derived from the harness identity: the configured service
    /// package, or the app package itself when the service ships inside
    /// the application under test.
    pub fn from_harness(harness: &Harness, tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            service_package: harness
                .service_package
                .clone()
                .unwrap_or_else(|| harness.app_package.clone()),
            app_package: harness.app_package.clone(),
        }
    }
}

/// Coordinates execution of a test plan over a pool of devices.
pub struct Orchestrator<D: DeviceHandle + Clone> {
    pool: DevicePool<D>,
    harness: Harness,
    artifact_dir: PathBuf,
    max_concurrent: usize,
    overall_timeout: Option<Duration>,
    test_timeout: Option<Duration>,
    listeners: Vec<Arc<dyn TestRunListener>>,
    control: Option<ControlConfig>,
}

impl<D: DeviceHandle + Clone> Orchestrator<D> {
    pub fn new(pool: DevicePool<D>, harness: Harness, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            harness,
            artifact_dir: artifact_dir.into(),
            max_concurrent: 0,
            overall_timeout: None,
            test_timeout: None,
            listeners: Vec::new(),
            control: None,
        }
    }

    /// Cap on devices running suites at once. 0 (the default) uses the
    /// whole pool.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Bound on the whole plan's wall-clock time.
    pub fn with_overall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.overall_timeout = timeout;
        self
    }

    /// Budget for any single test.
    pub fn with_test_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.test_timeout = timeout;
        self
    }

    /// Listeners are registered up front; there is no way to add one once
    /// execution has started.
    pub fn add_listener(mut self, listener: Arc<dyn TestRunListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Enable the device control protocol for every worker.
    pub fn with_control(mut self, control: ControlConfig) -> Self {
        self.control = Some(control);
        self
    }

    /// Run every suite in the plan to completion.
    ///
    /// `global_uploadables` are (local, remote) files each device needs
    /// for the duration of the plan; they are staged when a device joins
    /// the run and removed from every such device afterwards, even on
    /// timeout or failure.
    pub async fn execute_test_plan(
        &self,
        plan: SuiteStream,
        global_uploadables: Vec<(PathBuf, String)>,
    ) -> Result<StatsSnapshot> {
        let stats = Arc::new(RunStats::new());
        let mut listeners = self.listeners.clone();
        listeners.push(Arc::clone(&stats) as Arc<dyn TestRunListener>);
        let staged: Arc<Mutex<Vec<Device>>> = Arc::new(Mutex::new(Vec::new()));
        let globals = Arc::new(global_uploadables);
        let work_done = CancellationToken::new();

        let run = self.run_plan(&plan, &listeners, &staged, &globals, &work_done);
        let outcome = match self.overall_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow!("test plan did not complete within {limit:?}")),
            },
            None => run.await,
        };

        // Sweep plan-wide artifacts off every device that staged them,
        // whatever the exit path was.
        let devices: Vec<Device> = staged
            .lock()
            .expect("staging registry poisoned")
            .drain(..)
            .collect();
        for device in devices {
            let storage = DeviceStorage::new(device.clone());
            for (_, remote_path) in globals.iter() {
                if let Err(e) = storage.remove(remote_path, true).await {
                    warn!(
                        "failed to remove {remote_path} from {} [{e}]",
                        device.device_id()
                    );
                }
            }
        }

        outcome?;
        Ok(stats.snapshot())
    }

    async fn run_plan(
        &self,
        plan: &SuiteStream,
        listeners: &[Arc<dyn TestRunListener>],
        staged: &Arc<Mutex<Vec<Device>>>,
        globals: &Arc<Vec<(PathBuf, String)>>,
        work_done: &CancellationToken,
    ) -> Result<()> {
        let cap = if self.max_concurrent == 0 {
            self.pool.capacity()
        } else {
            self.max_concurrent.min(self.pool.capacity())
        };
        let slots = Arc::new(Semaphore::new(cap.max(1)));
        let mut workers: JoinSet<Result<(), WorkerError>> = JoinSet::new();

        loop {
            if work_done.is_cancelled() || plan.is_exhausted() {
                break;
            }
            tokio::select! {
                _ = work_done.cancelled() => break,
                result = workers.join_next(), if !workers.is_empty() => {
                    if let Some(result) = result {
                        if let Err(e) = check_worker(result) {
                            workers.abort_all();
                            return Err(e);
                        }
                    }
                }
                permit = Arc::clone(&slots).acquire_owned() => {
                    let permit = permit.expect("concurrency semaphore never closed");
                    // A device is reserved before the worker exists; the
                    // spawn gate is the reservation itself.
                    let reservation = tokio::select! {
                        _ = work_done.cancelled() => break,
                        reservation = self.pool.reserve() => reservation,
                    };
                    self.spawn_worker(
                        &mut workers, permit, reservation, plan, listeners, staged, globals,
                        work_done,
                    )?;
                }
            }
        }

        // No more work to hand out; wait for the in-flight workers.
        while let Some(result) = workers.join_next().await {
            if let Err(e) = check_worker(result) {
                workers.abort_all();
                return Err(e);
            }
        }
        info!("test plan complete");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_worker(
        &self,
        workers: &mut JoinSet<Result<(), WorkerError>>,
        permit: OwnedSemaphorePermit,
        reservation: Reservation<D>,
        plan: &SuiteStream,
        listeners: &[Arc<dyn TestRunListener>],
        staged: &Arc<Mutex<Vec<Device>>>,
        globals: &Arc<Vec<(PathBuf, String)>>,
        work_done: &CancellationToken,
    ) -> Result<()> {
        let device = reservation.device()?.device().clone();
        let worker = Worker::new(
            reservation,
            plan.clone(),
            self.harness.clone(),
            &self.artifact_dir,
        )
        .with_listeners(listeners.to_vec())
        .with_test_timeout(self.test_timeout);

        let control = self.control.clone();
        let staged = Arc::clone(staged);
        let globals = Arc::clone(globals);
        let work_done = work_done.clone();
        workers.spawn(async move {
            let _slot = permit;
            if !globals.is_empty() {
                let storage = DeviceStorage::new(device.clone());
                for (local_path, remote_path) in globals.iter() {
                    storage.push(local_path, remote_path).await?;
                }
                staged
                    .lock()
                    .expect("staging registry poisoned")
                    .push(device.clone());
            }

            let (worker, restoration) = match control {
                Some(config) => {
                    let restoration = Arc::new(DeviceRestoration::new());
                    let handler = Arc::new(ControlCommandHandler::new(
                        device.clone(),
                        config.service_package,
                        config.app_package,
                        Some(Arc::clone(&restoration) as Arc<dyn DeviceChangeListener>),
                    ));
                    if let Err(e) = handler.start_service().await {
                        warn!(
                            "could not start control service on {} [{e}]",
                            device.device_id()
                        );
                    }
                    let mut handlers: HashMap<String, Arc<dyn TagHandler>> = HashMap::new();
                    handlers.insert(config.tag, handler as Arc<dyn TagHandler>);
                    (worker.with_tag_handlers(handlers), Some(restoration))
                }
                None => (worker, None),
            };

            let result = worker.run(work_done).await;
            if let Some(restoration) = restoration {
                // Undo settings/properties tests changed through the
                // control protocol before the device goes back.
                restoration.restore(&device).await;
            }
            result
        });
        Ok(())
    }
}

fn check_worker(result: Result<Result<(), WorkerError>, JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow!(e).context("worker failed")),
        Err(join_error) if join_error.is_cancelled() => Ok(()),
        Err(join_error) => Err(anyhow!("worker panicked: {join_error}")),
    }
}
