//! Pipeline stages and the adapter contract.
//!
//! A stage is one step of the reconstruction workflow producing artifacts
//! consumed by later stages. Each stage is backed by an adapter that turns
//! configuration plus run context into a concrete container invocation and
//! validates the produced artifacts.

mod mesh;
mod pointcloud;
mod registry;
mod sfm;
mod splat;

pub use mesh::OdmMeshAdapter;
pub use pointcloud::GsToPointCloudAdapter;
pub use registry::StageRegistry;
pub use sfm::OpenSfmAdapter;
pub use splat::OpenSplatAdapter;

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TaskConfig;
use crate::context::ReconstructionContext;
use crate::docker::ContainerRunner;
use crate::error::{ConfigError, StageError};

/// The pipeline stages, in fixed dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Sparse reconstruction (structure from motion).
    Sfm,
    /// Dense reconstruction / Gaussian splatting.
    Reconstruction,
    /// Optional 3D mesh generation.
    Mesh,
    /// Optional splat-to-point-cloud conversion.
    PointCloud,
}

impl Stage {
    /// Execution order: SfM first, then reconstruction, then the optional
    /// downstream stages. Stages never run concurrently.
    pub const ORDER: [Stage; 4] = [
        Stage::Sfm,
        Stage::Reconstruction,
        Stage::Mesh,
        Stage::PointCloud,
    ];

    /// Stable stage name used for directories, markers and log files.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Sfm => "sfm",
            Stage::Reconstruction => "reconstruction",
            Stage::Mesh => "mesh",
            Stage::PointCloud => "point_cloud",
        }
    }

    /// Upstream stages whose artifacts this stage consumes.
    pub fn deps(&self) -> &'static [Stage] {
        match self {
            Stage::Sfm => &[],
            Stage::Reconstruction => &[Stage::Sfm],
            Stage::Mesh => &[Stage::Sfm],
            Stage::PointCloud => &[Stage::Reconstruction],
        }
    }

    /// Whether the configuration toggles this stage on.
    pub fn enabled_in(&self, config: &TaskConfig) -> bool {
        match self {
            Stage::Sfm => config.run_sparse,
            Stage::Reconstruction => config.run_gaussian,
            Stage::Mesh => config.run_mesh,
            Stage::PointCloud => config.run_point_cloud,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sfm" => Ok(Stage::Sfm),
            "reconstruction" => Ok(Stage::Reconstruction),
            "mesh" => Ok(Stage::Mesh),
            "point_cloud" => Ok(Stage::PointCloud),
            other => Err(ConfigError::UnknownStage(other.to_string())),
        }
    }
}

/// Why a stage failed. Algorithm failure is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// A required upstream artifact is absent; no container was launched.
    MissingDependency,
    /// The container exited with a non-zero code.
    NonZeroExit(i64),
    /// The container exceeded its wall-clock limit.
    Timeout,
    /// The container exited cleanly but a declared output is missing,
    /// empty, or structurally invalid.
    InvalidOutput,
    /// The run was stopped by an external request.
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::MissingDependency => write!(f, "missing dependency"),
            FailureReason::NonZeroExit(code) => write!(f, "exit code {code}"),
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::InvalidOutput => write!(f, "invalid output"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of one stage attempt, returned by an adapter.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// Whether the stage produced valid artifacts.
    pub success: bool,
    /// Artifacts the stage produced (orchestrator-view absolute paths).
    pub artifacts: Vec<PathBuf>,
    /// Failure classification when `success` is false.
    pub failure: Option<FailureReason>,
    /// Human-readable detail for logs and run metadata.
    pub message: Option<String>,
}

impl StageOutcome {
    /// A successful outcome with the given artifacts.
    pub fn success(artifacts: Vec<PathBuf>) -> Self {
        Self {
            success: true,
            artifacts,
            failure: None,
            message: None,
        }
    }

    /// A failed outcome with a classification and detail message.
    pub fn failure(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            success: false,
            artifacts: Vec::new(),
            failure: Some(reason),
            message: Some(message.into()),
        }
    }

    /// Whether the failure was a timeout.
    pub fn timed_out(&self) -> bool {
        matches!(self.failure, Some(FailureReason::Timeout))
    }
}

/// Contract every stage adapter satisfies.
///
/// Adapters read algorithm selection and overrides from the task
/// configuration, build a `ContainerInvocation` through the context's path
/// mapping, execute it on the given runner, and validate declared outputs.
/// Only configuration/path/engine errors propagate as `Err`; everything the
/// algorithm does wrong is reported inside the `StageOutcome`.
#[async_trait]
pub trait StageAdapter: Send + Sync {
    /// Which stage this adapter implements.
    fn stage(&self) -> Stage;

    /// Upstream artifacts that must exist before this stage may launch.
    fn required_artifacts(&self, ctx: &ReconstructionContext) -> Vec<PathBuf>;

    /// Outputs this stage declares; used for completeness checks on resume.
    fn declared_outputs(&self, ctx: &ReconstructionContext) -> Vec<PathBuf>;

    /// Executes the stage against the given container runner.
    async fn run(
        &self,
        ctx: &ReconstructionContext,
        runner: &dyn ContainerRunner,
    ) -> Result<StageOutcome, StageError>;
}

impl std::fmt::Debug for dyn StageAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StageAdapter").field(&self.stage()).finish()
    }
}

/// Checks an adapter's required upstream artifacts, returning a
/// `MissingDependency` outcome naming the first absent one.
///
/// Called by adapters before building any invocation, so a doomed stage
/// launches zero containers.
pub(crate) fn missing_dependency(
    adapter: &dyn StageAdapter,
    ctx: &ReconstructionContext,
) -> Option<StageOutcome> {
    for artifact in adapter.required_artifacts(ctx) {
        if !ctx.artifact_valid(&artifact) {
            return Some(StageOutcome::failure(
                FailureReason::MissingDependency,
                format!(
                    "required artifact missing or invalid: {} (run the '{}' stage first)",
                    artifact.display(),
                    adapter
                        .stage()
                        .deps()
                        .first()
                        .map(Stage::name)
                        .unwrap_or("upstream"),
                ),
            ));
        }
    }
    None
}

/// Resolves the GPU decision: an explicit config flag wins, otherwise the
/// engine is probed.
pub(crate) async fn resolve_gpu(config: &TaskConfig, runner: &dyn ContainerRunner) -> bool {
    match config.resources.use_gpu {
        Some(explicit) => explicit,
        None => runner.gpu_available().await,
    }
}

/// Renders a YAML scalar as a CLI argument value.
pub(crate) fn yaml_scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
    }
}

/// Maps a runner result onto a failure classification, or `None` for a
/// clean zero exit.
pub(crate) fn classify_failure(outcome: &crate::docker::RunOutcome) -> Option<FailureReason> {
    if outcome.cancelled {
        Some(FailureReason::Cancelled)
    } else if outcome.timed_out {
        Some(FailureReason::Timeout)
    } else if outcome.exit_code != 0 {
        Some(FailureReason::NonZeroExit(outcome.exit_code))
    } else {
        None
    }
}
