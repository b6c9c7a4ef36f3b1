//! Per-device worker: pulls suites off the shared plan and runs them.
//!
//! A worker owns one reserved device for its whole lifetime. Around the
//! suite loop it maintains the device-log capture (with per-test position
//! markers) and, when configured, a background task demultiplexing tagged
//! log lines to their handlers. Suite-level failures are reported to the
//! listeners and swallowed so one bad suite cannot take the device out of
//! rotation; failures that invalidate the worker itself (lost device,
//! expired lease, broken log capture) propagate to the scheduler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Harness;
use crate::device::{Device, DeviceError, DeviceHandle};
use crate::logcat::{DeviceLog, LogCapture, LogDemuxer, LogError, TagHandler};
use crate::parser::{ExecutionMarker, InstrumentationOutputParser, TestTimer};
use crate::pool::{PoolError, Reservation};
use crate::reporting::TestRunListener;
use crate::storage::DeviceStorage;
use crate::suite::{SuiteStream, TestSuite};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Aborts the wrapped task when dropped, so a background task cannot
/// outlive the future that spawned it, including when that future is
/// itself aborted.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs test suites on a single reserved device until the plan runs dry.
pub struct Worker<D: DeviceHandle> {
    reservation: Reservation<D>,
    suites: SuiteStream,
    harness: Harness,
    artifact_dir: PathBuf,
    listeners: Vec<Arc<dyn TestRunListener>>,
    test_timeout: Option<Duration>,
    tag_handlers: HashMap<String, Arc<dyn TagHandler>>,
}

impl<D: DeviceHandle> Worker<D> {
    pub fn new(
        reservation: Reservation<D>,
        suites: SuiteStream,
        harness: Harness,
        artifact_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            reservation,
            suites,
            harness,
            artifact_dir: artifact_dir.into(),
            listeners: Vec::new(),
            test_timeout: None,
            tag_handlers: HashMap::new(),
        }
    }

    pub fn with_listeners(mut self, listeners: Vec<Arc<dyn TestRunListener>>) -> Self {
        self.listeners = listeners;
        self
    }

    /// Budget for any single test; a test exceeding it errors its suite.
    pub fn with_test_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.test_timeout = timeout;
        self
    }

    /// Route tagged log lines to handlers for the duration of the run.
    pub fn with_tag_handlers(mut self, handlers: HashMap<String, Arc<dyn TagHandler>>) -> Self {
        self.tag_handlers = handlers;
        self
    }

    /// Work the plan until it is exhausted. Cancels `work_done` when this
    /// worker observes the end of the stream, so the scheduler stops
    /// reserving devices for work that no longer exists.
    pub async fn run(mut self, work_done: CancellationToken) -> Result<(), WorkerError> {
        let device = self.reservation.device()?.device().clone();
        let device_id = device.device_id().to_string();

        let device_log = DeviceLog::new(device.clone()).await?;
        let capture_path = self.artifact_dir.join(format!("logcat-{device_id}.txt"));
        let capture = Arc::new(device_log.capture_to_file(&capture_path)?);

        let demux_task = self.spawn_demux_task(&device_log);

        let result = self.suite_loop(&device, &capture, &work_done).await;

        capture.stop().await;
        let marker_path = self.artifact_dir.join(format!("log_markers-{device_id}.txt"));
        if let Err(e) = capture.write_markers(&marker_path).await {
            warn!("failed to write log markers for {device_id} [{e}]");
        }
        drop(demux_task);
        result
    }

    fn spawn_demux_task(&mut self, device_log: &DeviceLog) -> Option<AbortOnDrop> {
        if self.tag_handlers.is_empty() {
            return None;
        }
        let demuxer = LogDemuxer::new(std::mem::take(&mut self.tag_handlers));
        let stream = match device_log.tagged_stream(&demuxer.monitored_tags('I')) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("could not open tagged log stream [{e}]");
                return None;
            }
        };
        Some(AbortOnDrop(tokio::spawn(async move {
            let mut stream = stream;
            demuxer.process(&mut stream).await;
        })))
    }

    async fn suite_loop(
        &self,
        device: &Device,
        capture: &Arc<LogCapture>,
        work_done: &CancellationToken,
    ) -> Result<(), WorkerError> {
        loop {
            let Some(suite) = self.suites.next().await else {
                info!("test plan exhausted on {}", device.device_id());
                work_done.cancel();
                return Ok(());
            };
            // Re-validate the lease before committing the device to
            // another suite.
            self.reservation.device()?;
            self.run_suite(device, capture, &suite).await;
        }
    }

    /// Run one suite, signalling exactly one of `suite_ended` or
    /// `suite_errored` at the end.
    async fn run_suite(&self, device: &Device, capture: &Arc<LogCapture>, suite: &TestSuite) {
        info!("running suite '{}' on {}", suite.name, device.device_id());
        for listener in &self.listeners {
            listener.suite_started(&suite.name, 0);
        }
        let storage = DeviceStorage::new(device.clone());
        let outcome = self.execute_suite(device, capture, &storage, suite).await;

        for (_, remote_path) in &suite.uploadables {
            if let Err(e) = storage.remove(remote_path, true).await {
                warn!(
                    "failed to remove test vector {remote_path} from {} [{e}]",
                    device.device_id()
                );
            }
        }
        match outcome {
            Ok(duration) => {
                for listener in &self.listeners {
                    listener.suite_ended(&suite.name, duration);
                }
            }
            Err(message) => {
                warn!("suite '{}' errored: {message}", suite.name);
                for listener in &self.listeners {
                    listener.suite_errored(&suite.name, &message);
                }
            }
        }
    }

    async fn execute_suite(
        &self,
        device: &Device,
        capture: &Arc<LogCapture>,
        storage: &DeviceStorage,
        suite: &TestSuite,
    ) -> Result<Duration, String> {
        if suite.clear_data {
            device
                .clear_app_data(&self.harness.app_package)
                .await
                .map_err(|e| format!("failed to clear app data: {e}"))?;
        }
        for (local_path, remote_path) in &suite.uploadables {
            storage
                .push(local_path, remote_path)
                .await
                .map_err(|e| format!("failed to stage {}: {e}", local_path.display()))?;
        }

        let mut parser = InstrumentationOutputParser::new(self.listeners.clone());
        parser.add_execution_marker(Arc::clone(capture) as Arc<dyn ExecutionMarker>);
        let timer = self.test_timeout.map(|budget| Arc::new(TestTimer::new(budget)));
        if let Some(timer) = &timer {
            parser.add_execution_marker(Arc::clone(timer) as Arc<dyn ExecutionMarker>);
        }

        let mut args: Vec<String> = vec![
            "shell".into(),
            "am".into(),
            "instrument".into(),
            "-w".into(),
            "-r".into(),
        ];
        for (key, value) in &suite.parameters {
            args.push("-e".into());
            args.push(key.clone());
            args.push(value.clone());
        }
        args.push(self.harness.instrumentation_component());

        let mut stream = device
            .stream(args)
            .map_err(|e| format!("failed to start instrumentation: {e}"))?
            .with_unresponsive_timeout(self.test_timeout);

        loop {
            let line = match stream.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    stream.stop(true).await;
                    return Err(format!("instrumentation output ended abnormally: {e}"));
                }
            };
            debug!("[{}] {line}", device.device_id());
            if let Err(e) = parser.parse_line(&line) {
                stream.stop(true).await;
                return Err(format!("instrumentation protocol error: {e}"));
            }
            if let Some(test) = timer.as_ref().and_then(|t| t.overrun()) {
                stream.stop(true).await;
                return Err(format!("test {test} exceeded its time budget"));
            }
        }
        stream
            .wait(self.test_timeout)
            .await
            .map_err(|e| format!("instrumentation command failed: {e}"))?;

        Ok(parser.execution_time().unwrap_or(Duration::ZERO))
    }
}
