//! Run management: one active run at a time, queryable history, log tails.
//!
//! `RunManager` is the control surface an embedding process (CLI or a
//! future API server) drives. It enforces the single-active-run rule in
//! process, spawns the pipeline onto the runtime, and answers status and
//! log queries from the persisted run directories, so queries work for
//! runs started by earlier processes too.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::TaskConfig;
use crate::context::ReconstructionContext;
use crate::docker::{ContainerRunner, LogLine, StopSignal};
use crate::error::{PipelineError, ServiceError};
use crate::pipeline::{Pipeline, RunMeta, RunStatus};
use crate::stages::{Stage, StageRegistry};

/// A slice of the unified run log plus the cursor for the next read.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub content: String,
    pub next_offset: u64,
}

struct ActiveRun {
    run_id: String,
    handle: JoinHandle<Result<bool, PipelineError>>,
}

/// Single-slot run manager over a container runner.
pub struct RunManager {
    config: Arc<TaskConfig>,
    runner: Arc<dyn ContainerRunner>,
    registry: StageRegistry,
    stop: StopSignal,
    tap: broadcast::Sender<LogLine>,
    active: Mutex<Option<ActiveRun>>,
}

impl RunManager {
    pub fn new(
        config: Arc<TaskConfig>,
        runner: Arc<dyn ContainerRunner>,
        stop: StopSignal,
        tap: broadcast::Sender<LogLine>,
    ) -> Self {
        Self {
            config,
            runner,
            registry: StageRegistry::builtin(),
            stop,
            tap,
            active: Mutex::new(None),
        }
    }

    pub fn with_registry(mut self, registry: StageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Starts a run (fresh, or resuming `resume`) in the background and
    /// returns its run id.
    ///
    /// # Errors
    ///
    /// `ServiceError::RunInProgress` while another run is still executing;
    /// planning and context errors surface before anything is spawned.
    pub fn start(
        &self,
        requested: &[Stage],
        resume: Option<&str>,
    ) -> Result<String, ServiceError> {
        let mut active = self.active.lock().unwrap();
        if let Some(run) = active.as_ref() {
            if !run.handle.is_finished() {
                return Err(ServiceError::RunInProgress(run.run_id.clone()));
            }
        }

        // A stop latched by an earlier run must not cancel this one.
        self.stop.reset();

        let planned = Pipeline::plan(&self.config, requested)?;
        let ctx = match resume {
            Some(run_id) => ReconstructionContext::resume(Arc::clone(&self.config), run_id),
            None => ReconstructionContext::create(Arc::clone(&self.config)),
        }
        .map_err(PipelineError::from)?;

        let run_id = ctx.run_id().to_string();
        info!(run_id = %run_id, stages = ?planned, resumed = resume.is_some(), "run starting");

        let runner = Arc::clone(&self.runner);
        let pipeline = Pipeline::with_registry(self.registry.clone());
        let handle = tokio::spawn(async move {
            let result = pipeline.run(&ctx, runner.as_ref(), &planned).await;
            if let Err(e) = &result {
                error!(run_id = %ctx.run_id(), "pipeline aborted with engine error: {e}");
                // Terminal status so queries do not report a ghost run.
                if let Ok(mut meta) = RunMeta::load(ctx.run_dir()) {
                    meta.finish(RunStatus::Failed);
                    let _ = meta.save(ctx.run_dir());
                }
            }
            result
        });

        *active = Some(ActiveRun {
            run_id: run_id.clone(),
            handle,
        });
        Ok(run_id)
    }

    /// Waits for the active run to finish, returning the pipeline result.
    pub async fn wait(&self) -> Option<Result<bool, PipelineError>> {
        let run = self.active.lock().unwrap().take()?;
        match run.handle.await {
            Ok(result) => Some(result),
            Err(e) => {
                error!(run_id = %run.run_id, "run task panicked: {e}");
                Some(Ok(false))
            }
        }
    }

    /// Requests cancellation of the active run's container.
    pub fn stop(&self) -> Result<String, ServiceError> {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(run) if !run.handle.is_finished() => {
                info!(run_id = %run.run_id, "stop requested");
                self.stop.stop();
                Ok(run.run_id.clone())
            }
            _ => Err(ServiceError::NoActiveRun),
        }
    }

    /// Metadata for every run under the runs directory, oldest first.
    /// Directories without a parseable `run.json` are omitted.
    pub fn list_runs(&self) -> Result<Vec<RunMeta>, ServiceError> {
        let runs_dir = self.config.runs_dir()?;
        let mut runs = Vec::new();
        if runs_dir.is_dir() {
            for entry in std::fs::read_dir(&runs_dir)? {
                let path = entry?.path();
                if !path.is_dir() {
                    continue;
                }
                if let Ok(meta) = RunMeta::load(&path) {
                    runs.push(meta);
                }
            }
        }
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }

    /// Metadata for one run.
    pub fn status(&self, run_id: &str) -> Result<RunMeta, ServiceError> {
        let run_dir = self.run_dir(run_id)?;
        Ok(RunMeta::load(&run_dir)?)
    }

    /// Reads the unified run log from `offset`, returning the new content
    /// and the cursor to pass on the next call. An offset past the end of
    /// the file yields an empty chunk with the cursor clamped to the end.
    pub fn tail_logs(&self, run_id: &str, offset: u64) -> Result<LogChunk, ServiceError> {
        let log_path = self.run_dir(run_id)?.join("logs").join("run.log");
        let mut file = match std::fs::File::open(&log_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LogChunk {
                    content: String::new(),
                    next_offset: 0,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        let offset = offset.min(len);
        file.seek(SeekFrom::Start(offset))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let next_offset = offset + bytes.len() as u64;
        Ok(LogChunk {
            content: String::from_utf8_lossy(&bytes).into_owned(),
            next_offset,
        })
    }

    /// Subscribes to the live log tap (bounded, drop-oldest under lag).
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogLine> {
        self.tap.subscribe()
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf, ServiceError> {
        let run_dir = self.config.runs_dir()?.join(run_id);
        if !run_dir.is_dir() {
            return Err(ServiceError::RunNotFound(run_id.to_string()));
        }
        Ok(run_dir)
    }
}
