//! Task configuration for a reconstruction run.
//!
//! `TaskConfig` is an immutable snapshot of what the user asked for: which
//! stages to run, which algorithm (and Docker image) backs each stage, the
//! quality preset, and per-algorithm parameter overrides. It is loaded once
//! and never mutated; the effective configuration is copied into each run
//! directory for auditability.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Quality preset controlling algorithm defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    High,
    #[default]
    Medium,
    Low,
}

impl std::fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityPreset::High => write!(f, "high"),
            QualityPreset::Medium => write!(f, "medium"),
            QualityPreset::Low => write!(f, "low"),
        }
    }
}

/// Camera intrinsic hints forwarded to the SfM engine.
///
/// All fields are optional; when absent the engine falls back to EXIF data
/// or estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Camera projection model: perspective, fisheye, brown, equirectangular.
    pub model: String,
    /// Focal length in millimeters.
    pub focal_length_mm: Option<f64>,
    /// Radial distortion coefficients.
    pub distortion_k1: Option<f64>,
    pub distortion_k2: Option<f64>,
    /// Tangential distortion coefficients.
    pub distortion_p1: Option<f64>,
    pub distortion_p2: Option<f64>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            model: "perspective".to_string(),
            focal_length_mm: None,
            distortion_k1: None,
            distortion_k2: None,
            distortion_p1: None,
            distortion_p2: None,
        }
    }
}

/// Algorithm selection and the Docker image backing each stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmConfig {
    /// SfM algorithm name (registry key).
    pub sfm: String,
    /// Reconstruction/splatting algorithm name (registry key).
    pub reconstruction: String,
    /// Mesh algorithm name (registry key).
    pub mesh: String,
    /// Splat-to-point-cloud converter name (registry key).
    pub point_cloud: String,
    /// ODM image; includes OpenSfM.
    pub sfm_docker_image: String,
    pub reconstruction_docker_image: String,
    pub point_cloud_docker_image: String,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            sfm: "opensfm".to_string(),
            reconstruction: "opensplat".to_string(),
            mesh: "odm".to_string(),
            point_cloud: "gs2pc".to_string(),
            sfm_docker_image: "opendronemap/odm:latest".to_string(),
            reconstruction_docker_image: "opensplat:latest".to_string(),
            point_cloud_docker_image: "gs2pc-tool:latest".to_string(),
        }
    }
}

/// Resource flags passed through opaquely to sibling containers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResourceConfig {
    /// Force GPU on/off. `None` means probe the engine and use it if present.
    pub use_gpu: Option<bool>,
    /// Memory limit per stage container, in MB.
    pub memory_mb: Option<u64>,
    /// CPU cores per stage container.
    pub cpu_cores: Option<f64>,
}

/// Default wall-clock limit per stage container: 6 hours.
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 6 * 3600;

/// Immutable configuration snapshot for one reconstruction task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Project directory holding `images/` and `runs/`. Inferred from the
    /// config file location (or the `DATA_DIR` env var) when unset.
    pub working_dir: Option<PathBuf>,

    /// Algorithm selection per stage.
    pub algorithms: AlgorithmConfig,

    // Stage toggles.
    /// Sparse reconstruction (SfM).
    pub run_sparse: bool,
    /// 3D mesh generation (via ODM).
    pub run_mesh: bool,
    /// Gaussian splatting.
    pub run_gaussian: bool,
    /// Splat-to-point-cloud conversion.
    pub run_point_cloud: bool,

    /// Camera intrinsic hints.
    pub camera: CameraConfig,
    /// Use GPS data from images if available.
    pub use_gps: bool,
    /// Quality preset driving algorithm defaults.
    pub quality_preset: QualityPreset,

    /// SfM feature type (sift, akaze, ...).
    pub feature_type: String,
    /// Gaussian splatting spherical-harmonics degree (1-3).
    pub sh_degree: u32,

    /// Wall-clock limit per stage container, in seconds.
    pub stage_timeout_secs: u64,

    /// Resource flags forwarded to stage containers.
    pub resources: ResourceConfig,

    /// Per-algorithm overrides. Key = algorithm name (e.g. "opensfm"),
    /// value = parameter map merged on top of preset-derived defaults.
    pub params: HashMap<String, HashMap<String, serde_yaml::Value>>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            algorithms: AlgorithmConfig::default(),
            run_sparse: true,
            run_mesh: false,
            run_gaussian: true,
            run_point_cloud: false,
            camera: CameraConfig::default(),
            use_gps: true,
            quality_preset: QualityPreset::Medium,
            feature_type: "sift".to_string(),
            sh_degree: 3,
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            resources: ResourceConfig::default(),
            params: HashMap::new(),
        }
    }
}

impl TaskConfig {
    /// Loads a configuration from a YAML file.
    ///
    /// `working_dir` resolution precedence:
    /// 1. `DATA_DIR` environment variable,
    /// 2. explicit `working_dir` in the file,
    /// 3. the config file's own directory.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or if
    /// the resolved paths fail validation.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config: TaskConfig = serde_yaml::from_str(&text)?;

        if let Ok(data_dir) = std::env::var("DATA_DIR") {
            if !data_dir.trim().is_empty() {
                config.working_dir = Some(PathBuf::from(data_dir));
            }
        }
        if config.working_dir.is_none() {
            config.working_dir = path.parent().map(Path::to_path_buf);
        }

        config.validate()?;
        Ok(config)
    }

    /// Returns the validated working directory.
    pub fn working_dir(&self) -> Result<&Path, ConfigError> {
        self.working_dir
            .as_deref()
            .ok_or(ConfigError::MissingWorkingDir)
    }

    /// Input images directory: always `<working_dir>/images`.
    pub fn images_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.working_dir()?.join("images"))
    }

    /// Runs directory: always `<working_dir>/runs`.
    pub fn runs_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.working_dir()?.join("runs"))
    }

    /// Returns the override map for the named algorithm, empty when absent.
    pub fn overrides_for(&self, algorithm: &str) -> HashMap<String, serde_yaml::Value> {
        self.params.get(algorithm).cloned().unwrap_or_default()
    }

    /// Validates paths and stage-toggle consistency.
    ///
    /// # Errors
    ///
    /// - `WorkingDirNotAbsolute` / `WorkingDirUnreachable` for a bad
    ///   working directory,
    /// - `MissingImagesDir` when `<working_dir>/images` is absent,
    /// - `DependencyNotEnabled` when a downstream stage is toggled on
    ///   without its upstream (gaussian and mesh need sparse, point cloud
    ///   needs gaussian).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let working_dir = self.working_dir()?;
        if !working_dir.is_absolute() {
            return Err(ConfigError::WorkingDirNotAbsolute(working_dir.to_path_buf()));
        }
        if !working_dir.is_dir() {
            return Err(ConfigError::WorkingDirUnreachable(working_dir.to_path_buf()));
        }
        let images = working_dir.join("images");
        if !images.is_dir() {
            return Err(ConfigError::MissingImagesDir(images));
        }

        if self.run_gaussian && !self.run_sparse {
            return Err(ConfigError::DependencyNotEnabled {
                stage: "reconstruction".to_string(),
                requires: "run_sparse".to_string(),
            });
        }
        if self.run_mesh && !self.run_sparse {
            return Err(ConfigError::DependencyNotEnabled {
                stage: "mesh".to_string(),
                requires: "run_sparse".to_string(),
            });
        }
        if self.run_point_cloud && !self.run_gaussian {
            return Err(ConfigError::DependencyNotEnabled {
                stage: "point_cloud".to_string(),
                requires: "run_gaussian".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("images")).unwrap();
        dir
    }

    #[test]
    fn test_defaults() {
        let config = TaskConfig::default();
        assert!(config.run_sparse);
        assert!(config.run_gaussian);
        assert!(!config.run_mesh);
        assert!(!config.run_point_cloud);
        assert_eq!(config.quality_preset, QualityPreset::Medium);
        assert_eq!(config.algorithms.sfm, "opensfm");
        assert_eq!(config.algorithms.reconstruction, "opensplat");
        assert_eq!(config.sh_degree, 3);
    }

    #[test]
    fn test_validate_ok() {
        let dir = project_dir();
        let config = TaskConfig {
            working_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_relative_working_dir() {
        let config = TaskConfig {
            working_dir: Some(PathBuf::from("relative/dir")),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WorkingDirNotAbsolute(_))
        ));
    }

    #[test]
    fn test_validate_missing_images() {
        let dir = tempfile::tempdir().unwrap();
        let config = TaskConfig {
            working_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingImagesDir(_))
        ));
    }

    #[test]
    fn test_validate_gaussian_requires_sparse() {
        let dir = project_dir();
        let config = TaskConfig {
            working_dir: Some(dir.path().to_path_buf()),
            run_sparse: false,
            run_gaussian: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DependencyNotEnabled { .. })
        ));
    }

    #[test]
    fn test_from_yaml_infers_working_dir() {
        let dir = project_dir();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            "run_sparse: true\nrun_gaussian: false\nquality_preset: low\n",
        )
        .unwrap();

        let config = TaskConfig::from_yaml_file(&config_path).unwrap();
        assert_eq!(config.working_dir.as_deref(), Some(dir.path()));
        assert_eq!(config.quality_preset, QualityPreset::Low);
        assert!(!config.run_gaussian);
    }

    #[test]
    fn test_overrides_for() {
        let mut config = TaskConfig::default();
        let mut overrides = HashMap::new();
        overrides.insert(
            "feature_process_size".to_string(),
            serde_yaml::Value::Number(2048.into()),
        );
        config.params.insert("opensfm".to_string(), overrides);

        assert_eq!(config.overrides_for("opensfm").len(), 1);
        assert!(config.overrides_for("opensplat").is_empty());
    }
}
