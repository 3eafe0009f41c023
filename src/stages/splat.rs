//! OpenSplat adapter (Gaussian splatting).
//!
//! Consumes the OpenSfM project produced by the SfM stage and trains a
//! Gaussian splat, writing `splat.ply` into the reconstruction stage
//! directory. The whole run directory is mounted so the input project and
//! the output directory share one filesystem view with the sibling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::QualityPreset;
use crate::context::ReconstructionContext;
use crate::docker::{ContainerInvocation, ContainerRunner, Mount};
use crate::error::StageError;
use crate::stages::{
    classify_failure, missing_dependency, resolve_gpu, sfm::OpenSfmAdapter, yaml_scalar_to_string,
    FailureReason, Stage, StageAdapter, StageOutcome,
};

/// Run directory mount point inside the sibling container.
const CONTAINER_PROJECT: &str = "/project";
/// Images mount point inside the sibling container.
const CONTAINER_IMAGES: &str = "/images";

/// Gaussian splatting via OpenSplat.
#[derive(Debug, Default)]
pub struct OpenSplatAdapter;

impl OpenSplatAdapter {
    pub fn new() -> Self {
        Self
    }

    /// The trained splat artifact.
    pub fn splat_ply(ctx: &ReconstructionContext) -> PathBuf {
        ctx.stage_dir(Stage::Reconstruction).join("splat.ply")
    }

    /// Derives splat parameters: preset-driven iteration counts, the
    /// configured SH degree, then explicit overrides. The legacy
    /// `iterations` key is an alias for `n`.
    fn build_params(ctx: &ReconstructionContext) -> Vec<(String, String)> {
        let config = ctx.config();
        let mut params: HashMap<String, String> = HashMap::new();

        params.insert("sh-degree".to_string(), config.sh_degree.to_string());
        let (iterations, save_every) = match config.quality_preset {
            QualityPreset::High => (30_000, 5_000),
            QualityPreset::Medium => (15_000, 2_000),
            QualityPreset::Low => (7_000, 1_000),
        };
        params.insert("n".to_string(), iterations.to_string());
        params.insert("s".to_string(), save_every.to_string());

        for (key, value) in config.overrides_for(&config.algorithms.reconstruction) {
            let key = if key == "iterations" { "n".to_string() } else { key };
            params.insert(key, yaml_scalar_to_string(&value));
        }

        let mut params: Vec<_> = params.into_iter().collect();
        params.sort();
        params
    }

    fn build_invocation(
        ctx: &ReconstructionContext,
        use_gpu: bool,
    ) -> Result<ContainerInvocation, StageError> {
        let config = ctx.config();
        let host_run_dir = ctx.resolve_host_path(ctx.run_dir())?;
        let host_images_dir = ctx.resolve_host_path(&ctx.images_dir())?;

        // The SfM stage dir holds the OpenSfM project OpenSplat consumes.
        let container_input = format!("{CONTAINER_PROJECT}/{}", Stage::Sfm.name());
        let container_output = format!(
            "{CONTAINER_PROJECT}/{}/splat.ply",
            Stage::Reconstruction.name()
        );

        let mut args = vec![
            "opensplat".to_string(),
            container_input,
            "-o".to_string(),
            container_output,
            "--opensfm-image-path".to_string(),
            CONTAINER_IMAGES.to_string(),
        ];
        for (key, value) in Self::build_params(ctx) {
            if key.chars().count() == 1 {
                args.push(format!("-{key}"));
            } else {
                args.push(format!("--{key}"));
            }
            args.push(value);
        }

        Ok(
            ContainerInvocation::new(&config.algorithms.reconstruction_docker_image)
                .with_mount(Mount::rw(host_run_dir, CONTAINER_PROJECT))
                .with_mount(Mount::ro(host_images_dir, CONTAINER_IMAGES))
                .with_args(args)
                .with_timeout(Duration::from_secs(config.stage_timeout_secs))
                .with_gpu(use_gpu)
                .with_memory_mb(config.resources.memory_mb)
                .with_cpu_cores(config.resources.cpu_cores),
        )
    }
}

#[async_trait]
impl StageAdapter for OpenSplatAdapter {
    fn stage(&self) -> Stage {
        Stage::Reconstruction
    }

    fn required_artifacts(&self, ctx: &ReconstructionContext) -> Vec<PathBuf> {
        vec![OpenSfmAdapter::reconstruction_json(ctx)]
    }

    fn declared_outputs(&self, ctx: &ReconstructionContext) -> Vec<PathBuf> {
        vec![Self::splat_ply(ctx)]
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
        if !use_gpu {
            warn!("GPU not available; Gaussian splatting on CPU is extremely slow");
        }

        let invocation = Self::build_invocation(ctx, use_gpu)?;
        let run = runner
            .execute(Stage::Reconstruction, invocation, &ctx.logs_dir())
            .await?;

        if let Some(reason) = classify_failure(&run) {
            return Ok(StageOutcome::failure(
                reason.clone(),
                format!("splatting container failed: {reason}"),
            ));
        }

        let artifact = Self::splat_ply(ctx);
        if !ctx.artifact_valid(&artifact) {
            return Ok(StageOutcome::failure(
                FailureReason::InvalidOutput,
                format!("splat output missing or empty: {}", artifact.display()),
            ));
        }
        info!(artifact = %artifact.display(), "splat reconstruction finished");
        Ok(StageOutcome::success(vec![artifact]))
    }
}
