//! Sequential stage orchestrator.
//!
//! Stages run one at a time in fixed dependency order. The first stage
//! failure aborts the remaining stages; completed artifacts and their
//! markers are preserved, so a later resume picks up exactly where the run
//! stopped. Plan-time validation rejects stage selections whose
//! dependencies are disabled before any container is launched.

use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::TaskConfig;
use crate::context::{ReconstructionContext, StageRecord};
use crate::docker::ContainerRunner;
use crate::error::{ConfigError, PipelineError};
use crate::pipeline::meta::{RunMeta, RunStatus, StageState};
use crate::stages::{FailureReason, Stage, StageRegistry};

/// Drives a run through its planned stages.
pub struct Pipeline {
    registry: StageRegistry,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            registry: StageRegistry::builtin(),
        }
    }

    pub fn with_registry(registry: StageRegistry) -> Self {
        Self { registry }
    }

    /// Resolves which stages a run will execute, in dependency order.
    ///
    /// An empty request selects every enabled stage. An explicit request
    /// must name enabled stages whose upstream stages are also enabled;
    /// violations are rejected here, before anything runs.
    pub fn plan(config: &TaskConfig, requested: &[Stage]) -> Result<Vec<Stage>, ConfigError> {
        if requested.is_empty() {
            return Ok(Stage::ORDER
                .into_iter()
                .filter(|stage| stage.enabled_in(config))
                .collect());
        }

        for stage in requested {
            if !stage.enabled_in(config) {
                return Err(ConfigError::StageNotEnabled {
                    stage: stage.name().to_string(),
                });
            }
            for dep in stage.deps() {
                if !dep.enabled_in(config) {
                    return Err(ConfigError::DependencyNotEnabled {
                        stage: stage.name().to_string(),
                        requires: dep.name().to_string(),
                    });
                }
            }
        }

        Ok(Stage::ORDER
            .into_iter()
            .filter(|stage| requested.contains(stage))
            .collect())
    }

    /// Executes the planned stages against the runner.
    ///
    /// Returns `Ok(true)` when every stage completed (or was already
    /// complete), `Ok(false)` when a stage failed and the run aborted.
    /// Stages whose completion marker and artifacts are already valid are
    /// skipped, which makes re-running after a partial failure idempotent.
    pub async fn run(
        &self,
        ctx: &ReconstructionContext,
        runner: &dyn ContainerRunner,
        planned: &[Stage],
    ) -> Result<bool, PipelineError> {
        let mut meta = RunMeta::new(ctx.run_id(), planned);
        meta.save(ctx.run_dir())?;

        for &stage in planned {
            if ctx.is_stage_complete(stage) {
                info!(%stage, "stage already complete, skipping");
                meta.set_stage_state(stage, StageState::Skipped);
                meta.save(ctx.run_dir())?;
                continue;
            }

            let adapter = self.registry.create_for(stage, ctx.config())?;
            meta.set_stage_state(stage, StageState::Running);
            meta.save(ctx.run_dir())?;

            info!(%stage, "stage starting");
            let started_at = Utc::now();
            let started = Instant::now();
            let outcome = adapter
                .run(ctx, runner)
                .await
                .map_err(|source| PipelineError::Stage {
                    stage: stage.name().to_string(),
                    source,
                })?;
            let duration = started.elapsed();

            if outcome.success {
                let record = StageRecord {
                    stage: stage.name().to_string(),
                    started_at,
                    ended_at: Utc::now(),
                    exit_code: 0,
                    duration_secs: duration.as_secs_f64(),
                    artifacts: outcome.artifacts.clone(),
                };
                ctx.mark_stage_complete(stage, &record)?;
                meta.set_stage_state(stage, StageState::Completed);
                meta.save(ctx.run_dir())?;
                info!(%stage, duration_secs = duration.as_secs_f64(), "stage completed");
            } else {
                let reason = outcome
                    .failure
                    .clone()
                    .unwrap_or(FailureReason::InvalidOutput);
                warn!(
                    %stage,
                    %reason,
                    message = outcome.message.as_deref().unwrap_or(""),
                    "stage failed, aborting remaining stages"
                );
                let status = if reason == FailureReason::Cancelled {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                meta.fail_stage(stage, reason, outcome.message.clone());
                meta.finish(status);
                meta.save(ctx.run_dir())?;
                return Ok(false);
            }
        }

        meta.finish(RunStatus::Completed);
        meta.save(ctx.run_dir())?;
        info!(run_id = %ctx.run_id(), "run completed");
        Ok(true)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{ContainerInvocation, RunOutcome};
    use crate::error::DockerError;
    use crate::stages::{missing_dependency, StageAdapter, StageOutcome};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct NullRunner;

    #[async_trait]
    impl ContainerRunner for NullRunner {
        async fn execute(
            &self,
            _stage: Stage,
            _invocation: ContainerInvocation,
            _log_dir: &Path,
        ) -> Result<RunOutcome, DockerError> {
            Ok(RunOutcome {
                exit_code: 0,
                duration: Duration::ZERO,
                timed_out: false,
                cancelled: false,
            })
        }
    }

    /// Adapter that records calls, writes its artifact on success, and
    /// counts launches past the dependency gate.
    struct ScriptedAdapter {
        stage: Stage,
        succeed: bool,
        requires: Vec<Stage>,
        calls: Arc<Mutex<Vec<Stage>>>,
        launches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StageAdapter for ScriptedAdapter {
        fn stage(&self) -> Stage {
            self.stage
        }

        fn required_artifacts(&self, ctx: &ReconstructionContext) -> Vec<PathBuf> {
            self.requires
                .iter()
                .map(|dep| ctx.stage_dir(*dep).join("out.bin"))
                .collect()
        }

        fn declared_outputs(&self, ctx: &ReconstructionContext) -> Vec<PathBuf> {
            vec![ctx.stage_dir(self.stage).join("out.bin")]
        }

        async fn run(
            &self,
            ctx: &ReconstructionContext,
            _runner: &dyn ContainerRunner,
        ) -> Result<StageOutcome, crate::error::StageError> {
            self.calls.lock().unwrap().push(self.stage);
            if let Some(outcome) = missing_dependency(self, ctx) {
                return Ok(outcome);
            }
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                let artifact = ctx.stage_dir(self.stage).join("out.bin");
                std::fs::write(&artifact, b"data").unwrap();
                Ok(StageOutcome::success(vec![artifact]))
            } else {
                Ok(StageOutcome::failure(
                    FailureReason::NonZeroExit(1),
                    "scripted failure",
                ))
            }
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        ctx: ReconstructionContext,
        pipeline: Pipeline,
        calls: Arc<Mutex<Vec<Stage>>>,
        launches: Arc<AtomicUsize>,
    }

    /// All four stages enabled, scripted adapters registered under the
    /// default algorithm names.
    fn harness(failing: Option<Stage>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("images")).unwrap();
        let config = TaskConfig {
            working_dir: Some(dir.path().to_path_buf()),
            run_mesh: true,
            run_point_cloud: true,
            ..Default::default()
        };
        let names = [
            (Stage::Sfm, "opensfm"),
            (Stage::Reconstruction, "opensplat"),
            (Stage::Mesh, "odm"),
            (Stage::PointCloud, "gs2pc"),
        ];

        let calls = Arc::new(Mutex::new(Vec::new()));
        let launches = Arc::new(AtomicUsize::new(0));
        let mut registry = StageRegistry::builtin();
        for (stage, name) in names {
            let calls = Arc::clone(&calls);
            let launches = Arc::clone(&launches);
            registry.register(stage, name, move || {
                Box::new(ScriptedAdapter {
                    stage,
                    succeed: failing != Some(stage),
                    requires: stage.deps().to_vec(),
                    calls: Arc::clone(&calls),
                    launches: Arc::clone(&launches),
                })
            });
        }

        let ctx = ReconstructionContext::create(Arc::new(config)).unwrap();
        Harness {
            _dir: dir,
            ctx,
            pipeline: Pipeline::with_registry(registry),
            calls,
            launches,
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_dependency_order() {
        let h = harness(None);
        let planned = Pipeline::plan(h.ctx.config(), &[]).unwrap();
        assert_eq!(planned, Stage::ORDER.to_vec());

        let ok = h.pipeline.run(&h.ctx, &NullRunner, &planned).await.unwrap();
        assert!(ok);
        assert_eq!(*h.calls.lock().unwrap(), Stage::ORDER.to_vec());

        for stage in Stage::ORDER {
            assert!(h.ctx.is_stage_complete(stage));
        }
        let meta = RunMeta::load(h.ctx.run_dir()).unwrap();
        assert_eq!(meta.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_failure_aborts_and_preserves_completed_stages() {
        let h = harness(Some(Stage::Reconstruction));
        let planned = Pipeline::plan(h.ctx.config(), &[]).unwrap();

        let ok = h.pipeline.run(&h.ctx, &NullRunner, &planned).await.unwrap();
        assert!(!ok);
        // Mesh and point-cloud never ran.
        assert_eq!(
            *h.calls.lock().unwrap(),
            vec![Stage::Sfm, Stage::Reconstruction]
        );
        assert!(h.ctx.is_stage_complete(Stage::Sfm));
        assert!(!h.ctx.is_stage_complete(Stage::Reconstruction));

        let meta = RunMeta::load(h.ctx.run_dir()).unwrap();
        assert_eq!(meta.status, RunStatus::Failed);
        assert_eq!(
            meta.stage(Stage::Reconstruction).unwrap().state,
            StageState::Failed
        );
        assert_eq!(meta.stage(Stage::Mesh).unwrap().state, StageState::Pending);
    }

    #[tokio::test]
    async fn test_rerun_skips_completed_stages() {
        let h = harness(None);
        let planned = Pipeline::plan(h.ctx.config(), &[]).unwrap();
        assert!(h.pipeline.run(&h.ctx, &NullRunner, &planned).await.unwrap());
        let first_pass = h.calls.lock().unwrap().len();

        // Second pass over the same run directory launches nothing.
        assert!(h.pipeline.run(&h.ctx, &NullRunner, &planned).await.unwrap());
        assert_eq!(h.calls.lock().unwrap().len(), first_pass);

        let meta = RunMeta::load(h.ctx.run_dir()).unwrap();
        assert_eq!(meta.status, RunStatus::Completed);
        for stage in Stage::ORDER {
            assert_eq!(meta.stage(stage).unwrap().state, StageState::Skipped);
        }
    }

    #[tokio::test]
    async fn test_resume_reruns_only_failed_stage() {
        let failing = harness(Some(Stage::Reconstruction));
        let planned = Pipeline::plan(failing.ctx.config(), &[]).unwrap();
        assert!(!failing
            .pipeline
            .run(&failing.ctx, &NullRunner, &planned)
            .await
            .unwrap());

        // Resume against the same run directory with a healthy engine.
        let healthy = harness(None);
        let ok = healthy
            .pipeline
            .run(&failing.ctx, &NullRunner, &planned)
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(
            *healthy.calls.lock().unwrap(),
            vec![Stage::Reconstruction, Stage::Mesh, Stage::PointCloud]
        );

        let meta = RunMeta::load(failing.ctx.run_dir()).unwrap();
        assert_eq!(meta.stage(Stage::Sfm).unwrap().state, StageState::Skipped);
        assert_eq!(
            meta.stage(Stage::Reconstruction).unwrap().state,
            StageState::Completed
        );
    }

    #[tokio::test]
    async fn test_missing_dependency_launches_nothing() {
        let h = harness(Some(Stage::Sfm));
        // SfM fails before producing out.bin, so reconstruction's gate
        // would trip if it ever ran; run reconstruction alone instead.
        let planned = vec![Stage::Reconstruction];
        let ok = h.pipeline.run(&h.ctx, &NullRunner, &planned).await.unwrap();
        assert!(!ok);
        assert_eq!(h.launches.load(Ordering::SeqCst), 0);

        let meta = RunMeta::load(h.ctx.run_dir()).unwrap();
        assert_eq!(
            meta.stage(Stage::Reconstruction).unwrap().failure,
            Some(FailureReason::MissingDependency)
        );
    }

    #[test]
    fn test_plan_rejects_disabled_stage() {
        let config = TaskConfig::default();
        let err = Pipeline::plan(&config, &[Stage::Mesh]).unwrap_err();
        assert!(matches!(err, ConfigError::StageNotEnabled { .. }));
    }

    #[test]
    fn test_plan_rejects_disabled_dependency() {
        let config = TaskConfig {
            run_sparse: false,
            ..Default::default()
        };
        let err = Pipeline::plan(&config, &[Stage::Reconstruction]).unwrap_err();
        assert!(matches!(err, ConfigError::DependencyNotEnabled { .. }));
    }

    #[test]
    fn test_plan_defaults_to_enabled_stages() {
        let config = TaskConfig::default();
        let planned = Pipeline::plan(&config, &[]).unwrap();
        assert_eq!(planned, vec![Stage::Sfm, Stage::Reconstruction]);
    }
}
