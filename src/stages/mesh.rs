//! Optional mesh stage: ODM continued past OpenSfM.
//!
//! ODM generates its mesh inside the project directory it already used for
//! SfM, so this stage re-invokes ODM on the SfM stage directory without the
//! `--end-with opensfm` cutoff. ODM reuses the completed OpenSfM outputs it
//! finds there. The mesh stage keeps its own completion marker; its
//! artifact lives under the SfM project per ODM's own layout.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::context::ReconstructionContext;
use crate::docker::{ContainerInvocation, ContainerRunner, Mount};
use crate::error::StageError;
use crate::stages::{
    classify_failure, missing_dependency, resolve_gpu, sfm::OpenSfmAdapter, FailureReason, Stage,
    StageAdapter, StageOutcome,
};

const CONTAINER_PROJECT: &str = "/datasets/project";

/// Mesh generation via ODM.
#[derive(Debug, Default)]
pub struct OdmMeshAdapter;

impl OdmMeshAdapter {
    pub fn new() -> Self {
        Self
    }

    /// The mesh artifact, inside the ODM project (the SfM stage dir).
    pub fn mesh_ply(ctx: &ReconstructionContext) -> PathBuf {
        ctx.stage_dir(Stage::Sfm).join("odm_meshing/odm_mesh.ply")
    }

    fn build_invocation(
        ctx: &ReconstructionContext,
        use_gpu: bool,
    ) -> Result<ContainerInvocation, StageError> {
        let config = ctx.config();
        let host_project = ctx.resolve_host_path(&ctx.stage_dir(Stage::Sfm))?;
        let host_images = ctx.resolve_host_path(&ctx.images_dir())?;

        let args = vec![
            "--project-path".to_string(),
            "/datasets".to_string(),
            "--ignore-gsd".to_string(),
            "--end-with".to_string(),
            "odm_meshing".to_string(),
            "project".to_string(),
        ];

        Ok(ContainerInvocation::new(&config.algorithms.sfm_docker_image)
            .with_mount(Mount::rw(host_project, CONTAINER_PROJECT))
            .with_mount(Mount::ro(host_images, format!("{CONTAINER_PROJECT}/images")))
            .with_args(args)
            .with_timeout(Duration::from_secs(config.stage_timeout_secs))
            .with_gpu(use_gpu)
            .with_memory_mb(config.resources.memory_mb)
            .with_cpu_cores(config.resources.cpu_cores))
    }
}

#[async_trait]
impl StageAdapter for OdmMeshAdapter {
    fn stage(&self) -> Stage {
        Stage::Mesh
    }

    fn required_artifacts(&self, ctx: &ReconstructionContext) -> Vec<PathBuf> {
        vec![OpenSfmAdapter::reconstruction_json(ctx)]
    }

    fn declared_outputs(&self, ctx: &ReconstructionContext) -> Vec<PathBuf> {
        vec![Self::mesh_ply(ctx)]
    }

    async fn run(
        &self,
        ctx: &ReconstructionContext,
        runner: &dyn ContainerRunner,
    ) -> Result<StageOutcome, StageError> {
        if let Some(outcome) = missing_dependency(self, ctx) {
            return Ok(outcome);
        }

        let use_gpu = resolve_gpu(ctx.config(), runner).await;
        let invocation = Self::build_invocation(ctx, use_gpu)?;
        let run = runner
            .execute(Stage::Mesh, invocation, &ctx.logs_dir())
            .await?;

        if let Some(reason) = classify_failure(&run) {
            return Ok(StageOutcome::failure(
                reason.clone(),
                format!("mesh container failed: {reason}"),
            ));
        }

        let artifact = Self::mesh_ply(ctx);
        if !ctx.artifact_valid(&artifact) {
            return Ok(StageOutcome::failure(
                FailureReason::InvalidOutput,
                format!("mesh output missing or empty: {}", artifact.display()),
            ));
        }
        info!(artifact = %artifact.display(), "mesh generated");
        Ok(StageOutcome::success(vec![artifact]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use std::sync::Arc;

    #[test]
    fn test_invocation_continues_odm_to_meshing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("images")).unwrap();
        let config = TaskConfig {
            working_dir: Some(dir.path().to_path_buf()),
            run_mesh: true,
            ..Default::default()
        };
        let ctx = ReconstructionContext::create(Arc::new(config)).unwrap();

        let inv = OdmMeshAdapter::build_invocation(&ctx, false).unwrap();
        assert!(inv.args.windows(2).any(|w| w == ["--end-with", "odm_meshing"]));
        assert_eq!(inv.mounts[0].container, PathBuf::from(CONTAINER_PROJECT));
    }
}
