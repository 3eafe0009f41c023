//! Optional splat-to-point-cloud conversion stage.
//!
//! Wraps the gs2pc tool image: reads the trained `splat.ply` and writes a
//! conventional point cloud into the point-cloud stage directory.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::context::ReconstructionContext;
use crate::docker::{ContainerInvocation, ContainerRunner, Mount};
use crate::error::StageError;
use crate::stages::{
    classify_failure, missing_dependency, resolve_gpu, splat::OpenSplatAdapter, FailureReason,
    Stage, StageAdapter, StageOutcome,
};

const CONTAINER_PROJECT: &str = "/project";

/// Gaussian-splat to point-cloud conversion.
#[derive(Debug, Default)]
pub struct GsToPointCloudAdapter;

impl GsToPointCloudAdapter {
    pub fn new() -> Self {
        Self
    }

    /// The converted point-cloud artifact.
    pub fn point_cloud_ply(ctx: &ReconstructionContext) -> PathBuf {
        ctx.stage_dir(Stage::PointCloud).join("point_cloud.ply")
    }

    fn build_invocation(
        ctx: &ReconstructionContext,
        use_gpu: bool,
    ) -> Result<ContainerInvocation, StageError> {
        let config = ctx.config();
        let host_run_dir = ctx.resolve_host_path(ctx.run_dir())?;

        let container_input = format!(
            "{CONTAINER_PROJECT}/{}/splat.ply",
            Stage::Reconstruction.name()
        );
        let container_output = format!(
            "{CONTAINER_PROJECT}/{}/point_cloud.ply",
            Stage::PointCloud.name()
        );

        Ok(
            ContainerInvocation::new(&config.algorithms.point_cloud_docker_image)
                .with_mount(Mount::rw(host_run_dir, CONTAINER_PROJECT))
                .with_args(vec![
                    "gs2pc".to_string(),
                    container_input,
                    "-o".to_string(),
                    container_output,
                ])
                .with_timeout(Duration::from_secs(config.stage_timeout_secs))
                .with_gpu(use_gpu)
                .with_memory_mb(config.resources.memory_mb)
                .with_cpu_cores(config.resources.cpu_cores),
        )
    }
}

#[async_trait]
impl StageAdapter for GsToPointCloudAdapter {
    fn stage(&self) -> Stage {
        Stage::PointCloud
    }

    fn required_artifacts(&self, ctx: &ReconstructionContext) -> Vec<PathBuf> {
        vec![OpenSplatAdapter::splat_ply(ctx)]
    }

    fn declared_outputs(&self, ctx: &ReconstructionContext) -> Vec<PathBuf> {
        vec![Self::point_cloud_ply(ctx)]
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
            .execute(Stage::PointCloud, invocation, &ctx.logs_dir())
            .await?;

        if let Some(reason) = classify_failure(&run) {
            return Ok(StageOutcome::failure(
                reason.clone(),
                format!("point-cloud container failed: {reason}"),
            ));
        }

        let artifact = Self::point_cloud_ply(ctx);
        if !ctx.artifact_valid(&artifact) {
            return Ok(StageOutcome::failure(
                FailureReason::InvalidOutput,
                format!("point cloud missing or empty: {}", artifact.display()),
            ));
        }
        info!(artifact = %artifact.display(), "point cloud converted");
        Ok(StageOutcome::success(vec![artifact]))
    }
}
