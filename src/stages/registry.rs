//! Algorithm registry: stage slot plus algorithm name selects an adapter
//! constructor.
//!
//! No inheritance hierarchy; just a map from registry key to a constructor
//! producing a value satisfying the `StageAdapter` contract. New engines
//! plug in by registering a constructor under their name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::TaskConfig;
use crate::error::ConfigError;
use crate::stages::{
    GsToPointCloudAdapter, OdmMeshAdapter, OpenSfmAdapter, OpenSplatAdapter, Stage, StageAdapter,
};

type AdapterCtor = Arc<dyn Fn() -> Box<dyn StageAdapter> + Send + Sync>;

/// Per-stage maps of algorithm name to adapter constructor.
#[derive(Clone)]
pub struct StageRegistry {
    slots: HashMap<Stage, HashMap<String, AdapterCtor>>,
}

impl StageRegistry {
    /// Registry pre-populated with the built-in engines.
    pub fn builtin() -> Self {
        let mut registry = Self {
            slots: HashMap::new(),
        };
        registry.register(Stage::Sfm, "opensfm", || Box::new(OpenSfmAdapter::new()));
        registry.register(Stage::Reconstruction, "opensplat", || {
            Box::new(OpenSplatAdapter::new())
        });
        registry.register(Stage::Mesh, "odm", || Box::new(OdmMeshAdapter::new()));
        registry.register(Stage::PointCloud, "gs2pc", || {
            Box::new(GsToPointCloudAdapter::new())
        });
        registry
    }

    /// Registers (or replaces) a constructor under the given name.
    pub fn register(
        &mut self,
        stage: Stage,
        name: impl Into<String>,
        ctor: impl Fn() -> Box<dyn StageAdapter> + Send + Sync + 'static,
    ) {
        self.slots
            .entry(stage)
            .or_default()
            .insert(name.into(), Arc::new(ctor));
    }

    /// Creates the adapter registered for `stage` under `name`.
    ///
    /// # Errors
    ///
    /// `ConfigError::UnknownAlgorithm` when no constructor is registered.
    pub fn create(&self, stage: Stage, name: &str) -> Result<Box<dyn StageAdapter>, ConfigError> {
        self.slots
            .get(&stage)
            .and_then(|algos| algos.get(name))
            .map(|ctor| ctor())
            .ok_or_else(|| ConfigError::UnknownAlgorithm {
                slot: stage.name().to_string(),
                name: name.to_string(),
            })
    }

    /// Creates the adapter the configuration selects for `stage`.
    pub fn create_for(
        &self,
        stage: Stage,
        config: &TaskConfig,
    ) -> Result<Box<dyn StageAdapter>, ConfigError> {
        let name = match stage {
            Stage::Sfm => &config.algorithms.sfm,
            Stage::Reconstruction => &config.algorithms.reconstruction,
            Stage::Mesh => &config.algorithms.mesh,
            Stage::PointCloud => &config.algorithms.point_cloud,
        };
        self.create(stage, name)
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookups() {
        let registry = StageRegistry::builtin();
        for stage in Stage::ORDER {
            let adapter = registry.create_for(stage, &TaskConfig::default()).unwrap();
            assert_eq!(adapter.stage(), stage);
        }
    }

    #[test]
    fn test_unknown_algorithm() {
        let registry = StageRegistry::builtin();
        let err = registry.create(Stage::Sfm, "colmap").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAlgorithm { .. }));
    }

    #[test]
    fn test_register_custom() {
        let mut registry = StageRegistry::builtin();
        registry.register(Stage::Sfm, "opensfm-custom", || {
            Box::new(OpenSfmAdapter::new())
        });
        assert!(registry.create(Stage::Sfm, "opensfm-custom").is_ok());
    }
}
