//! Run-scoped context: directory layout, config snapshot, stage records.
//!
//! One `ReconstructionContext` exists per run. It owns the run directory
//! layout, the host/container path map, and the stage-completion markers
//! that make resume possible. The context itself is not persisted; its
//! directory layout on disk is the durable contract:
//!
//! ```text
//! {working_dir}/runs/<run_id>/
//!   config.yaml                      # effective config snapshot
//!   run.json                         # run metadata
//!   <stage_name>/                    # algorithm-specific contents
//!   logs/run.log
//!   logs/<stage_name>_<attempt>.log
//!   <stage_name>.done                # completion marker
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TaskConfig;
use crate::error::{ContextError, PathError};
use crate::paths::PathMap;
use crate::stages::Stage;

/// Completion record for one stage, serialized to `<stage>.done`.
///
/// A stage counts as complete only if this marker exists *and* every
/// recorded artifact still exists and passes the validity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name.
    pub stage: String,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    pub ended_at: DateTime<Utc>,
    /// Container exit code of the successful attempt.
    pub exit_code: i64,
    /// Wall-clock duration of the attempt, in seconds.
    pub duration_secs: f64,
    /// Produced artifacts, relative to the run directory.
    pub artifacts: Vec<PathBuf>,
}

/// Run-scoped paths and state shared by all stage adapters.
#[derive(Debug, Clone)]
pub struct ReconstructionContext {
    config: Arc<TaskConfig>,
    run_id: String,
    run_dir: PathBuf,
    path_map: PathMap,
}

impl ReconstructionContext {
    /// Creates a fresh run: timestamp-derived id (numeric suffix on
    /// collision), eagerly created stage subdirectories, and a snapshot of
    /// the effective configuration for auditability.
    pub fn create(config: Arc<TaskConfig>) -> Result<Self, ContextError> {
        let runs_dir = config.runs_dir()?;
        std::fs::create_dir_all(&runs_dir)?;

        let base_id = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut run_id = base_id.clone();
        let mut suffix = 0u32;
        while runs_dir.join(&run_id).exists() {
            suffix += 1;
            run_id = format!("{base_id}_{suffix}");
        }

        let ctx = Self::layout(config, run_id, &runs_dir)?;
        info!(run_id = %ctx.run_id, run_dir = %ctx.run_dir.display(), "created run directory");

        ctx.snapshot_config()?;
        Ok(ctx)
    }

    /// Loads an existing run directory for resume.
    ///
    /// # Errors
    ///
    /// `ContextError::RunNotFound` when no directory exists for `run_id`.
    pub fn resume(config: Arc<TaskConfig>, run_id: &str) -> Result<Self, ContextError> {
        let runs_dir = config.runs_dir()?;
        if !runs_dir.join(run_id).is_dir() {
            return Err(ContextError::RunNotFound(run_id.to_string()));
        }
        let ctx = Self::layout(config, run_id.to_string(), &runs_dir)?;
        info!(run_id = %ctx.run_id, "resuming existing run directory");
        Ok(ctx)
    }

    fn layout(
        config: Arc<TaskConfig>,
        run_id: String,
        runs_dir: &Path,
    ) -> Result<Self, ContextError> {
        let run_dir = runs_dir.join(&run_id);
        std::fs::create_dir_all(run_dir.join("logs"))?;
        for stage in Stage::ORDER {
            std::fs::create_dir_all(run_dir.join(stage.name()))?;
        }
        let path_map = PathMap::from_env(config.working_dir()?)?;

        Ok(Self {
            config,
            run_id,
            run_dir,
            path_map,
        })
    }

    /// Copies the effective configuration into the run directory.
    fn snapshot_config(&self) -> Result<(), ContextError> {
        let text = serde_yaml::to_string(self.config.as_ref())?;
        std::fs::write(self.run_dir.join("config.yaml"), text)?;
        Ok(())
    }

    /// The task configuration backing this run.
    pub fn config(&self) -> &Arc<TaskConfig> {
        &self.config
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.run_dir.join("logs")
    }

    /// Output directory for the given stage.
    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.run_dir.join(stage.name())
    }

    /// Input images directory: `<working_dir>/images`.
    pub fn images_dir(&self) -> PathBuf {
        // working_dir was validated at config load time
        self.config
            .working_dir
            .as_deref()
            .unwrap_or_else(|| Path::new("/"))
            .join("images")
    }

    /// The configured host/container translation pair.
    pub fn path_map(&self) -> &PathMap {
        &self.path_map
    }

    /// Maps a path from the orchestrator's view to its host-absolute
    /// equivalent, for use in sibling-container mount arguments.
    pub fn resolve_host_path(&self, path: &Path) -> Result<PathBuf, PathError> {
        self.path_map.to_host(path)
    }

    /// Path of the completion marker for a stage.
    pub fn marker_path(&self, stage: Stage) -> PathBuf {
        self.run_dir.join(format!("{}.done", stage.name()))
    }

    /// Writes the stage-completion marker atomically (temp file + rename),
    /// recording artifacts relative to the run directory.
    pub fn mark_stage_complete(
        &self,
        stage: Stage,
        record: &StageRecord,
    ) -> Result<(), ContextError> {
        let mut record = record.clone();
        record.artifacts = record
            .artifacts
            .iter()
            .map(|p| {
                p.strip_prefix(&self.run_dir)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|_| p.clone())
            })
            .collect();

        let marker = self.marker_path(stage);
        let tmp = marker.with_extension("done.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
        std::fs::rename(&tmp, &marker)?;
        debug!(stage = %stage, marker = %marker.display(), "stage marked complete");
        Ok(())
    }

    /// Reads the stage record, if a parseable marker exists.
    ///
    /// A truncated or unparseable marker (crashed mid-write) is treated as
    /// absent, which forces the stage to rerun on resume.
    pub fn stage_record(&self, stage: Stage) -> Option<StageRecord> {
        let bytes = std::fs::read(self.marker_path(stage)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Whether a stage is complete: marker present *and* every recorded
    /// artifact exists and passes the validity check.
    pub fn is_stage_complete(&self, stage: Stage) -> bool {
        match self.stage_record(stage) {
            Some(record) => record
                .artifacts
                .iter()
                .all(|rel| self.artifact_valid(&self.run_dir.join(rel))),
            None => false,
        }
    }

    /// Artifact validity: exists, non-empty, and structurally parseable
    /// for structured formats (JSON). Zero-length or truncated outputs are
    /// treated as incomplete.
    pub fn artifact_valid(&self, path: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        if meta.is_dir() {
            return std::fs::read_dir(path).map(|mut d| d.next().is_some()).unwrap_or(false);
        }
        if meta.len() == 0 {
            return false;
        }
        if path.extension().is_some_and(|ext| ext == "json") {
            let Ok(bytes) = std::fs::read(path) else {
                return false;
            };
            return serde_json::from_slice::<serde_json::Value>(&bytes).is_ok();
        }
        true
    }
}
