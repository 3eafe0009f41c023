//! Host/container path virtualization for Docker-outside-of-Docker.
//!
//! The orchestrator runs inside its own container and launches *sibling*
//! containers through the shared Docker socket. Any path handed to the
//! engine for a sibling mount must therefore be a host path, never a path
//! from the orchestrator's own filesystem view. Exactly one pair is
//! configured: the host data directory and the mount point where the
//! orchestrator sees that same directory. Every exchanged path is produced
//! by substituting one prefix for the other; anything outside the pair
//! fails fast instead of silently producing artifacts the orchestrator
//! cannot locate later.

use std::path::{Path, PathBuf};

use crate::error::PathError;

/// The single configured (host dir, container mount point) translation pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMap {
    host_data_dir: PathBuf,
    mount_point: PathBuf,
}

impl PathMap {
    /// Creates a translation pair. Both paths must be absolute.
    pub fn new(
        host_data_dir: impl Into<PathBuf>,
        mount_point: impl Into<PathBuf>,
    ) -> Result<Self, PathError> {
        let host_data_dir = host_data_dir.into();
        let mount_point = mount_point.into();
        if !host_data_dir.is_absolute() {
            return Err(PathError::NotAbsolute(host_data_dir));
        }
        if !mount_point.is_absolute() {
            return Err(PathError::NotAbsolute(mount_point));
        }
        Ok(Self {
            host_data_dir,
            mount_point,
        })
    }

    /// Builds the pair from the environment.
    ///
    /// With `HOST_DATA_DIR` set (the DooD deployment), the pair is
    /// (`$HOST_DATA_DIR`, `working_dir`): the orchestrator sees the shared
    /// directory at `working_dir` while the host knows it as
    /// `$HOST_DATA_DIR`. Without it (plain host execution) the pair is the
    /// identity mapping.
    pub fn from_env(working_dir: &Path) -> Result<Self, PathError> {
        match std::env::var("HOST_DATA_DIR") {
            Ok(host) if !host.trim().is_empty() => Self::new(host, working_dir),
            _ => Self::new(working_dir, working_dir),
        }
    }

    /// Host data directory (as the container engine sees it).
    pub fn host_data_dir(&self) -> &Path {
        &self.host_data_dir
    }

    /// Mount point of the shared directory in the orchestrator's own view.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Maps a path from the orchestrator's view to its host equivalent.
    ///
    /// # Errors
    ///
    /// `PathError::NotUnderMountPoint` when the path does not live under
    /// the configured mount point.
    pub fn to_host(&self, path: &Path) -> Result<PathBuf, PathError> {
        let rel = path
            .strip_prefix(&self.mount_point)
            .map_err(|_| PathError::NotUnderMountPoint {
                path: path.to_path_buf(),
                mount_point: self.mount_point.clone(),
            })?;
        Ok(self.host_data_dir.join(rel))
    }

    /// Maps a host path back into the orchestrator's view.
    ///
    /// # Errors
    ///
    /// `PathError::NotUnderHostDir` when the path does not live under the
    /// configured host data directory.
    pub fn to_container(&self, path: &Path) -> Result<PathBuf, PathError> {
        let rel = path
            .strip_prefix(&self.host_data_dir)
            .map_err(|_| PathError::NotUnderHostDir {
                path: path.to_path_buf(),
                host_dir: self.host_data_dir.clone(),
            })?;
        Ok(self.mount_point.join(rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let map = PathMap::new("/home/user/data", "/project").unwrap();
        let own = Path::new("/project/runs/20250101_120000/sfm");

        let host = map.to_host(own).unwrap();
        assert_eq!(host, PathBuf::from("/home/user/data/runs/20250101_120000/sfm"));
        assert_eq!(map.to_container(&host).unwrap(), own);
    }

    #[test]
    fn test_mount_point_itself_maps_to_host_root() {
        let map = PathMap::new("/data/proj", "/project").unwrap();
        assert_eq!(
            map.to_host(Path::new("/project")).unwrap(),
            PathBuf::from("/data/proj")
        );
    }

    #[test]
    fn test_identity_pair() {
        let map = PathMap::new("/data/proj", "/data/proj").unwrap();
        let p = Path::new("/data/proj/images");
        assert_eq!(map.to_host(p).unwrap(), p);
        assert_eq!(map.to_container(p).unwrap(), p);
    }

    #[test]
    fn test_unmappable_path_fails_fast() {
        let map = PathMap::new("/home/user/data", "/project").unwrap();
        let err = map.to_host(Path::new("/tmp/outside")).unwrap_err();
        assert!(matches!(err, PathError::NotUnderMountPoint { .. }));

        let err = map.to_container(Path::new("/var/elsewhere")).unwrap_err();
        assert!(matches!(err, PathError::NotUnderHostDir { .. }));
    }

    #[test]
    fn test_relative_paths_rejected() {
        assert!(matches!(
            PathMap::new("relative", "/project"),
            Err(PathError::NotAbsolute(_))
        ));
        assert!(matches!(
            PathMap::new("/data", "relative"),
            Err(PathError::NotAbsolute(_))
        ));
    }
}
