//! Error types for recon3d operations.
//!
//! Defines error types for the major subsystems:
//! - Task configuration loading and validation
//! - Host/container path virtualization
//! - Docker container management
//! - Stage adapter execution
//! - Pipeline orchestration and the run-management service

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("working_dir is not set and could not be inferred")]
    MissingWorkingDir,

    #[error("working_dir must be an absolute path, got '{0}'")]
    WorkingDirNotAbsolute(PathBuf),

    #[error("working_dir does not exist or is not a directory: {0}")]
    WorkingDirUnreachable(PathBuf),

    #[error("input images directory not found: {0} (place your images in <working_dir>/images/)")]
    MissingImagesDir(PathBuf),

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("stage '{stage}' is not enabled in the configuration")]
    StageNotEnabled { stage: String },

    #[error("stage '{stage}' requires '{requires}' to be enabled")]
    DependencyNotEnabled { stage: String, requires: String },

    #[error("unknown {slot} algorithm '{name}'")]
    UnknownAlgorithm { slot: String, name: String },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised when the path-virtualization invariant is violated.
///
/// These indicate a deployment defect: a path crossed the DooD boundary
/// without belonging to the configured (host dir, mount point) pair.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("path '{path}' is not under the container mount point '{mount_point}'")]
    NotUnderMountPoint { path: PathBuf, mount_point: PathBuf },

    #[error("path '{path}' is not under the host data directory '{host_dir}'")]
    NotUnderHostDir { path: PathBuf, host_dir: PathBuf },

    #[error("path mapping requires absolute paths, got '{0}'")]
    NotAbsolute(PathBuf),
}

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("failed to pull image '{image}': {message}")]
    PullFailed { image: String, message: String },

    #[error("failed to create container: {0}")]
    CreateFailed(String),

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("error reading container output: {0}")]
    LogStream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while reading or writing run-scoped state.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("run '{0}' not found under the runs directory")]
    RunNotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised past the stage-adapter boundary.
///
/// Algorithm failure is *not* an error: it is reported as a failed
/// `StageOutcome`. Only configuration, path-mapping, and engine errors
/// propagate as `StageError`.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during pipeline orchestration.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("stage '{stage}' error: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the run-management service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("another run is in progress: {0}")]
    RunInProgress(String),

    #[error("no run is currently in progress")]
    NoActiveRun,

    #[error("run '{0}' not found")]
    RunNotFound(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
