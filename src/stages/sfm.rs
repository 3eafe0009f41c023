//! OpenSfM adapter, running through the ODM image.
//!
//! ODM wraps OpenSfM and expects this project structure inside the
//! container:
//!
//! ```text
//! /datasets/project/
//!   images/          # input images (mounted read-only)
//!   opensfm/
//!     config.yaml    # written by this adapter before launch
//!     reconstruction.json
//! ```
//!
//! The stage directory is mounted as the ODM project; the pose/sparse-point
//! artifact `opensfm/reconstruction.json` is what downstream stages consume.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::context::ReconstructionContext;
use crate::docker::{ContainerInvocation, ContainerRunner, Mount};
use crate::error::StageError;
use crate::stages::{
    classify_failure, missing_dependency, resolve_gpu, FailureReason, Stage, StageAdapter,
    StageOutcome,
};

/// ODM project path inside the sibling container.
const CONTAINER_PROJECT: &str = "/datasets/project";

/// Structure-from-motion via ODM/OpenSfM.
#[derive(Debug, Default)]
pub struct OpenSfmAdapter;

impl OpenSfmAdapter {
    pub fn new() -> Self {
        Self
    }

    /// The pose/sparse-point artifact this stage produces.
    pub fn reconstruction_json(ctx: &ReconstructionContext) -> PathBuf {
        ctx.stage_dir(Stage::Sfm).join("opensfm/reconstruction.json")
    }

    /// Derives the OpenSfM configuration: built-in defaults, then the
    /// quality preset, then camera hints, then explicit per-algorithm
    /// overrides (highest precedence).
    fn build_sfm_config(ctx: &ReconstructionContext) -> BTreeMap<String, serde_yaml::Value> {
        let config = ctx.config();
        let mut sfm: BTreeMap<String, serde_yaml::Value> = BTreeMap::new();

        sfm.insert(
            "feature_type".into(),
            config.feature_type.to_uppercase().into(),
        );
        sfm.insert("matcher_type".into(), "FLANN".into());
        sfm.insert(
            "matching_gps_neighbors".into(),
            (if config.use_gps { 8 } else { 0 }).into(),
        );
        sfm.insert(
            "camera_projection_type".into(),
            config.camera.model.clone().into(),
        );

        let camera = &config.camera;
        if camera.focal_length_mm.is_some() {
            // Known optics: a deterministic matcher index behaves better.
            sfm.insert("flann_algorithm".into(), "KDTREE".into());
        }
        if let Some(k1) = camera.distortion_k1 {
            sfm.insert("radial_distortion_k1".into(), k1.into());
        }
        if let Some(k2) = camera.distortion_k2 {
            sfm.insert("radial_distortion_k2".into(), k2.into());
        }
        if let Some(p1) = camera.distortion_p1 {
            sfm.insert("tangential_distortion_p1".into(), p1.into());
        }
        if let Some(p2) = camera.distortion_p2 {
            sfm.insert("tangential_distortion_p2".into(), p2.into());
        }

        let (process_size, min_frames) = match config.quality_preset {
            crate::config::QualityPreset::High => (2048, 8000),
            crate::config::QualityPreset::Medium => (1600, 4000),
            crate::config::QualityPreset::Low => (1024, 2000),
        };
        sfm.insert("feature_process_size".into(), process_size.into());
        sfm.insert("feature_min_frames".into(), min_frames.into());

        for (key, value) in config.overrides_for(&config.algorithms.sfm) {
            sfm.insert(key, value);
        }

        sfm
    }

    /// Builds the ODM invocation through the context's path map.
    fn build_invocation(
        ctx: &ReconstructionContext,
        use_gpu: bool,
    ) -> Result<ContainerInvocation, StageError> {
        let config = ctx.config();
        let host_stage_dir = ctx.resolve_host_path(&ctx.stage_dir(Stage::Sfm))?;
        let host_images_dir = ctx.resolve_host_path(&ctx.images_dir())?;

        let mut args = vec![
            "--project-path".to_string(),
            "/datasets".to_string(),
            "--ignore-gsd".to_string(),
        ];
        if !config.run_mesh {
            // SfM only; the mesh stage reruns ODM past this point.
            args.push("--end-with".to_string());
            args.push("opensfm".to_string());
        }
        if !config.feature_type.eq_ignore_ascii_case("sift") {
            args.push("--feature-type".to_string());
            args.push(config.feature_type.to_uppercase());
        }
        args.push("project".to_string());

        Ok(ContainerInvocation::new(&config.algorithms.sfm_docker_image)
            .with_mount(Mount::rw(host_stage_dir, CONTAINER_PROJECT))
            .with_mount(Mount::ro(
                host_images_dir,
                format!("{CONTAINER_PROJECT}/images"),
            ))
            .with_args(args)
            .with_timeout(Duration::from_secs(config.stage_timeout_secs))
            .with_gpu(use_gpu)
            .with_memory_mb(config.resources.memory_mb)
            .with_cpu_cores(config.resources.cpu_cores))
    }
}

/// Checks the pose artifact: parseable JSON with at least one camera in the
/// first reconstruction.
pub(crate) fn validate_reconstruction_json(path: &Path) -> Result<usize, String> {
    let bytes =
        std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    if bytes.is_empty() {
        return Err(format!("{} is empty", path.display()));
    }
    let value: JsonValue = serde_json::from_slice(&bytes)
        .map_err(|e| format!("{} is not valid JSON: {e}", path.display()))?;

    let reconstructions = value
        .as_array()
        .ok_or_else(|| format!("{} is not a reconstruction array", path.display()))?;
    let cameras = reconstructions
        .first()
        .and_then(|r| r.get("cameras"))
        .and_then(JsonValue::as_object)
        .ok_or_else(|| format!("{} has no cameras", path.display()))?;
    if cameras.is_empty() {
        return Err(format!("{} contains zero cameras", path.display()));
    }
    Ok(cameras.len())
}

#[async_trait]
impl StageAdapter for OpenSfmAdapter {
    fn stage(&self) -> Stage {
        Stage::Sfm
    }

    fn required_artifacts(&self, _ctx: &ReconstructionContext) -> Vec<PathBuf> {
        Vec::new()
    }

    fn declared_outputs(&self, ctx: &ReconstructionContext) -> Vec<PathBuf> {
        vec![Self::reconstruction_json(ctx)]
    }

    async fn run(
        &self,
        ctx: &ReconstructionContext,
        runner: &dyn ContainerRunner,
    ) -> Result<StageOutcome, StageError> {
        if let Some(outcome) = missing_dependency(self, ctx) {
            return Ok(outcome);
        }

        let opensfm_dir = ctx.stage_dir(Stage::Sfm).join("opensfm");
        std::fs::create_dir_all(&opensfm_dir)?;
        let sfm_config = Self::build_sfm_config(ctx);
        std::fs::write(
            opensfm_dir.join("config.yaml"),
            serde_yaml::to_string(&sfm_config)?,
        )?;

        let use_gpu = resolve_gpu(ctx.config(), runner).await;
        if !use_gpu {
            warn!("GPU not available; SfM falls back to CPU mode");
        }

        let invocation = Self::build_invocation(ctx, use_gpu)?;
        let run = runner
            .execute(Stage::Sfm, invocation, &ctx.logs_dir())
            .await?;

        if let Some(reason) = classify_failure(&run) {
            return Ok(StageOutcome::failure(
                reason.clone(),
                format!("SfM container failed: {reason}"),
            ));
        }

        let artifact = Self::reconstruction_json(ctx);
        match validate_reconstruction_json(&artifact) {
            Ok(cameras) => {
                info!(cameras, artifact = %artifact.display(), "SfM reconstruction validated");
                Ok(StageOutcome::success(vec![artifact]))
            }
            Err(message) => Ok(StageOutcome::failure(FailureReason::InvalidOutput, message)),
        }
    }
}
