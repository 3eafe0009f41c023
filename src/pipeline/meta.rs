//! Run metadata persisted as `run.json` in the run directory.
//!
//! Rewritten atomically on every state transition so an external observer
//! (or a later `runs`/`status` query) always sees a consistent snapshot.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ContextError;
use crate::stages::{FailureReason, Stage};

/// Lifecycle of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Planned but not started yet.
    Pending,
    /// Currently executing.
    Running,
    /// Finished with valid artifacts.
    Completed,
    /// Finished unsuccessfully; the run aborts here.
    Failed,
    /// Already complete from a previous attempt; not re-run.
    Skipped,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Completed => "completed",
            StageState::Failed => "failed",
            StageState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-stage entry in the run metadata, kept in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMeta {
    pub stage: String,
    pub state: StageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Snapshot of a run's state, serialized to `run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageMeta>,
}

impl RunMeta {
    pub const FILE_NAME: &'static str = "run.json";

    /// Fresh metadata with every planned stage pending.
    pub fn new(run_id: impl Into<String>, planned: &[Stage]) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            stages: planned
                .iter()
                .map(|stage| StageMeta {
                    stage: stage.name().to_string(),
                    state: StageState::Pending,
                    failure: None,
                    message: None,
                })
                .collect(),
        }
    }

    /// Loads `run.json` from a run directory.
    pub fn load(run_dir: &Path) -> Result<Self, ContextError> {
        let bytes = std::fs::read(run_dir.join(Self::FILE_NAME))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Writes `run.json` atomically (temp file + rename).
    pub fn save(&self, run_dir: &Path) -> Result<(), ContextError> {
        let path = run_dir.join(Self::FILE_NAME);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// The entry for a stage, if it was planned.
    pub fn stage(&self, stage: Stage) -> Option<&StageMeta> {
        self.stages.iter().find(|s| s.stage == stage.name())
    }

    /// Transitions a stage's state.
    pub fn set_stage_state(&mut self, stage: Stage, state: StageState) {
        if let Some(entry) = self.stages.iter_mut().find(|s| s.stage == stage.name()) {
            entry.state = state;
        }
    }

    /// Marks a stage failed with its classification and detail message.
    pub fn fail_stage(&mut self, stage: Stage, reason: FailureReason, message: Option<String>) {
        if let Some(entry) = self.stages.iter_mut().find(|s| s.stage == stage.name()) {
            entry.state = StageState::Failed;
            entry.failure = Some(reason);
            entry.message = message;
        }
    }

    /// Closes out the run with a terminal status.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = RunMeta::new("20250101_120000", &[Stage::Sfm, Stage::Reconstruction]);
        meta.set_stage_state(Stage::Sfm, StageState::Completed);
        meta.fail_stage(
            Stage::Reconstruction,
            FailureReason::NonZeroExit(137),
            Some("killed".to_string()),
        );
        meta.finish(RunStatus::Failed);
        meta.save(dir.path()).unwrap();

        let loaded = RunMeta::load(dir.path()).unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert!(loaded.ended_at.is_some());
        assert_eq!(loaded.stage(Stage::Sfm).unwrap().state, StageState::Completed);
        let recon = loaded.stage(Stage::Reconstruction).unwrap();
        assert_eq!(recon.state, StageState::Failed);
        assert_eq!(recon.failure, Some(FailureReason::NonZeroExit(137)));
    }

    #[test]
    fn test_unplanned_stage_absent() {
        let meta = RunMeta::new("r", &[Stage::Sfm]);
        assert!(meta.stage(Stage::Mesh).is_none());
    }
}
