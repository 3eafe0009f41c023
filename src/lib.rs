//! recon3d: containerized 3D reconstruction pipeline orchestrator.
//!
//! This library turns a directory of photos into sparse reconstructions,
//! Gaussian splats, meshes and point clouds by sequencing containerized
//! photogrammetry engines, with stage-granular resume and unified logging.

// Core modules
pub mod cli;
pub mod config;
pub mod context;
pub mod docker;
pub mod error;
pub mod paths;
pub mod pipeline;
pub mod service;
pub mod stages;

// Re-export commonly used error types
pub use error::{
    ConfigError, ContextError, DockerError, PathError, PipelineError, ServiceError, StageError,
};
