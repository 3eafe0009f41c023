//! Stage container execution: streaming, timeout, cancellation.
//!
//! `DockerRunner` executes one `ContainerInvocation` at a time: it streams
//! output line-by-line into the log fan-out, extracts coarse progress,
//! enforces the wall-clock limit (graceful stop, then force kill), and
//! honors an external stop request. A non-zero exit is reported in the
//! result, never raised; some engines produce partial-but-usable output
//! despite failing, and interpreting that is the adapter's job. The runner
//! performs no retries; retry policy belongs upstream.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::docker::client::{ContainerEngine, DockerClient};
use crate::docker::invocation::ContainerInvocation;
use crate::docker::logs::{LogLine, LogSink, LOG_TAP_CAPACITY};
use crate::docker::progress::ProgressTracker;
use crate::error::DockerError;
use crate::stages::Stage;

/// Grace period between the graceful stop and the force kill.
const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Result of one container execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Container exit code; `-1` when the container never exited cleanly.
    pub exit_code: i64,
    /// Wall-clock duration of the execution.
    pub duration: Duration,
    /// Whether the wall-clock limit fired.
    pub timed_out: bool,
    /// Whether an external stop request terminated the container.
    pub cancelled: bool,
}

impl RunOutcome {
    /// Clean, in-time, uncancelled zero exit.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

/// Cooperative stop request shared between the service and the runner.
///
/// A stop is latched in the watch value, so it fires even when it arrives
/// while no container is executing (between stages, or before the first
/// launch).
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests termination of the active container.
    pub fn stop(&self) {
        // send() fails without a live receiver; send_replace always latches.
        self.tx.send_replace(true);
    }

    /// Clears a delivered stop request so the signal can arm a new run.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once a stop is requested, immediately if already latched.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // Sender lives in self, so wait_for cannot error before a send.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The capability the orchestrator and adapters depend on: run one
/// invocation for one stage, streaming logs under `log_dir`.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    async fn execute(
        &self,
        stage: Stage,
        invocation: ContainerInvocation,
        log_dir: &Path,
    ) -> Result<RunOutcome, DockerError>;

    /// Whether the engine can grant GPU access to containers. Defaults to
    /// no; the Docker-backed runner probes the engine.
    async fn gpu_available(&self) -> bool {
        false
    }
}

/// Container runner backed by an engine (Docker in production).
pub struct DockerRunner {
    engine: Arc<dyn ContainerEngine>,
    grace: Duration,
    tap: broadcast::Sender<LogLine>,
    progress: Arc<ProgressTracker>,
    stop: StopSignal,
}

impl DockerRunner {
    pub fn new(client: DockerClient) -> Self {
        Self::from_engine(Arc::new(client))
    }

    pub(crate) fn from_engine(engine: Arc<dyn ContainerEngine>) -> Self {
        let (tap, _) = broadcast::channel(LOG_TAP_CAPACITY);
        Self {
            engine,
            grace: DEFAULT_GRACE,
            tap,
            progress: Arc::new(ProgressTracker::new()),
            stop: StopSignal::new(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Subscribes to the live log tap (bounded, drop-oldest).
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogLine> {
        self.tap.subscribe()
    }

    /// The sender side of the log tap, for fan-out owners upstream.
    pub fn log_tap(&self) -> broadcast::Sender<LogLine> {
        self.tap.clone()
    }

    /// Latest extracted progress for a stage, 0-100.
    pub fn progress(&self, stage: Stage) -> Option<f64> {
        self.progress.get(stage.name())
    }

    /// The stop handle for this runner.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    async fn terminate(&self, id: &str) {
        if let Err(e) = self
            .engine
            .stop_container(id, self.grace.as_secs() as i64)
            .await
        {
            warn!(container = %id, "graceful stop failed, force removing: {e}");
        }
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    async fn execute(
        &self,
        stage: Stage,
        invocation: ContainerInvocation,
        log_dir: &Path,
    ) -> Result<RunOutcome, DockerError> {
        let started = Instant::now();
        let timeout = invocation.timeout;

        info!(stage = %stage, image = %invocation.image, "starting stage container");

        self.engine.ensure_image(&invocation.image).await?;

        let name = format!(
            "recon3d_{}_{}",
            stage.name(),
            Utc::now().format("%Y%m%d_%H%M%S%3f")
        );
        let id = self.engine.create_container(&name, &invocation).await?;

        let (mut sink, _stage_log) = match LogSink::open(log_dir, stage.name(), self.tap.clone()) {
            Ok(opened) => opened,
            Err(e) => {
                let _ = self.engine.remove_container(&id, true).await;
                return Err(e.into());
            }
        };
        sink.write_comment(&format!("Log started at {}", Utc::now().to_rfc3339()))?;
        sink.write_comment(&format!("Command: {}", invocation.describe()))?;

        if let Err(e) = self.engine.start_container(&id).await {
            let _ = self.engine.remove_container(&id, true).await;
            return Err(e);
        }

        // Stream output concurrently with the wait/timeout clock. Lines are
        // fanned out to the log files and the broadcast tap; progress is
        // extracted best-effort.
        let mut log_stream = self.engine.output_stream(&id);
        let progress = Arc::clone(&self.progress);
        let stage_name = stage.name().to_string();
        let log_task = tokio::spawn(async move {
            let mut pending = String::new();
            while let Some(chunk) = log_stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        pending.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = pending.find('\n') {
                            let line: String = pending.drain(..=pos).collect();
                            progress.observe_line(&stage_name, &line);
                            if let Err(e) = sink.write_line(&line) {
                                warn!("failed to write log line: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        warn!("log stream error: {e}");
                        break;
                    }
                }
            }
            if !pending.is_empty() {
                progress.observe_line(&stage_name, &pending);
                let _ = sink.write_line(&pending);
            }
            sink
        });

        let mut timed_out = false;
        let mut cancelled = false;
        let exit_code = tokio::select! {
            result = self.engine.wait_container(&id) => match result {
                Ok(code) => code,
                Err(e) => {
                    error!(stage = %stage, "wait failed: {e}");
                    -1
                }
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(stage = %stage, ?timeout, "stage timed out, stopping container");
                timed_out = true;
                self.terminate(&id).await;
                -1
            }
            _ = self.stop.wait() => {
                info!(stage = %stage, "stop requested, terminating container");
                cancelled = true;
                self.terminate(&id).await;
                -1
            }
        };

        // The log stream ends once the container stops; reclaim the sink
        // for the footer.
        let sink = log_task.await;
        if let Ok(mut sink) = sink {
            let _ = sink.write_comment(&format!("Exit code: {exit_code}"));
            let _ = sink.write_comment(&format!("Finished at {}", Utc::now().to_rfc3339()));
            let _ = sink.flush();
        }

        if let Err(e) = self.engine.remove_container(&id, true).await {
            warn!(container = %id, "failed to remove container: {e}");
        }

        let outcome = RunOutcome {
            exit_code,
            duration: started.elapsed(),
            timed_out,
            cancelled,
        };
        info!(
            stage = %stage,
            exit_code = outcome.exit_code,
            timed_out = outcome.timed_out,
            cancelled = outcome.cancelled,
            duration_secs = outcome.duration.as_secs_f64(),
            "stage container finished"
        );
        Ok(outcome)
    }

    async fn gpu_available(&self) -> bool {
        self.engine.probe_gpu().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, BoxStream};
    use std::sync::Mutex;

    /// Scripted engine: fixed exit behavior, canned output, call recording.
    struct FakeEngine {
        /// `None` pends forever, like a container that never exits.
        exit: Option<i64>,
        output: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeEngine {
        fn new(exit: Option<i64>) -> Self {
            Self {
                exit,
                output: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_output(mut self, lines: &[&str]) -> Self {
            self.output = lines.iter().map(|l| l.to_string()).collect();
            self
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn called(&self, call: &str) -> bool {
            self.calls.lock().unwrap().iter().any(|c| c == call)
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn ensure_image(&self, _image: &str) -> Result<(), DockerError> {
            self.record("ensure_image");
            Ok(())
        }

        async fn create_container(
            &self,
            _name: &str,
            _invocation: &ContainerInvocation,
        ) -> Result<String, DockerError> {
            self.record("create");
            Ok("fake-container".to_string())
        }

        async fn start_container(&self, _id: &str) -> Result<(), DockerError> {
            self.record("start");
            Ok(())
        }

        async fn stop_container(&self, _id: &str, _grace_secs: i64) -> Result<(), DockerError> {
            self.record("stop");
            Ok(())
        }

        async fn remove_container(&self, _id: &str, _force: bool) -> Result<(), DockerError> {
            self.record("remove");
            Ok(())
        }

        async fn wait_container(&self, _id: &str) -> Result<i64, DockerError> {
            match self.exit {
                Some(code) => Ok(code),
                None => futures::future::pending().await,
            }
        }

        fn output_stream(&self, _id: &str) -> BoxStream<'static, Result<Vec<u8>, DockerError>> {
            let chunks: Vec<Result<Vec<u8>, DockerError>> =
                self.output.iter().map(|l| Ok(l.clone().into_bytes())).collect();
            stream::iter(chunks).boxed()
        }

        async fn probe_gpu(&self) -> bool {
            false
        }
    }

    fn invocation(timeout: Duration) -> ContainerInvocation {
        ContainerInvocation::new("engine:latest")
            .with_args(vec!["run".to_string()])
            .with_timeout(timeout)
    }

    #[test]
    fn test_outcome_succeeded() {
        let ok = RunOutcome {
            exit_code: 0,
            duration: Duration::from_secs(1),
            timed_out: false,
            cancelled: false,
        };
        assert!(ok.succeeded());

        let timed_out = RunOutcome {
            exit_code: -1,
            duration: Duration::from_secs(5),
            timed_out: true,
            cancelled: false,
        };
        assert!(!timed_out.succeeded());

        let nonzero = RunOutcome {
            exit_code: 137,
            timed_out: false,
            cancelled: false,
            duration: Duration::from_secs(1),
        };
        assert!(!nonzero.succeeded());
    }

    #[tokio::test]
    async fn test_stop_signal() {
        let signal = StopSignal::new();
        assert!(!signal.is_stopped());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        signal.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_stopped());

        // wait() resolves immediately once stopped.
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_latches_without_active_waiter() {
        // No receiver exists yet; the request must still land.
        let signal = StopSignal::new();
        signal.stop();
        assert!(signal.is_stopped());
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_signal_reset_rearms() {
        let signal = StopSignal::new();
        signal.stop();
        signal.reset();
        assert!(!signal.is_stopped());
        signal.stop();
        assert!(signal.is_stopped());
    }

    #[tokio::test]
    async fn test_execute_streams_output_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new(Some(0)).with_output(&["extracting 50%\n"]));
        let runner = DockerRunner::from_engine(engine.clone());

        let outcome = runner
            .execute(Stage::Sfm, invocation(Duration::from_secs(5)), dir.path())
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(runner.progress(Stage::Sfm), Some(50.0));
        assert!(engine.called("remove"));

        let run_log = std::fs::read_to_string(dir.path().join("run.log")).unwrap();
        assert!(run_log.contains("[sfm] extracting 50%"));
        assert!(run_log.contains("Exit code: 0"));
    }

    #[tokio::test]
    async fn test_timeout_terminates_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new(None));
        let runner =
            DockerRunner::from_engine(engine.clone()).with_grace(Duration::from_millis(10));

        let started = Instant::now();
        let outcome = runner
            .execute(Stage::Sfm, invocation(Duration::from_millis(50)), dir.path())
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert!(!outcome.cancelled);
        assert_eq!(outcome.exit_code, -1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(engine.called("stop"));
        assert!(engine.called("remove"));
    }

    #[tokio::test]
    async fn test_stop_before_execute_cancels_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new(None));
        let runner = DockerRunner::from_engine(engine.clone());

        // The request lands while nothing is executing.
        runner.stop_signal().stop();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            runner.execute(Stage::Sfm, invocation(Duration::from_secs(3600)), dir.path()),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(outcome.cancelled);
        assert!(!outcome.timed_out);
        assert!(engine.called("stop"));
        assert!(engine.called("remove"));
    }

    #[tokio::test]
    async fn test_stop_during_execute_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new(None));
        let runner = Arc::new(DockerRunner::from_engine(engine.clone()));
        let signal = runner.stop_signal();

        let task = {
            let runner = Arc::clone(&runner);
            let log_dir = dir.path().to_path_buf();
            tokio::spawn(async move {
                runner
                    .execute(Stage::Sfm, invocation(Duration::from_secs(3600)), &log_dir)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        signal.stop();

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.exit_code, -1);
    }
}
