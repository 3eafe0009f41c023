//! Container invocation value object.
//!
//! Produced by a stage adapter, consumed exactly once by the Docker runner,
//! then discarded. Mount sources are *host* paths; adapters must run every
//! path through the context's path map before it lands here.

use std::path::PathBuf;
use std::time::Duration;

/// One host/container bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host-absolute source path.
    pub host: PathBuf,
    /// Path inside the sibling container.
    pub container: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
}

impl Mount {
    /// A read-write bind mount.
    pub fn rw(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    /// A read-only bind mount.
    pub fn ro(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    /// Docker bind string: `host:container[:ro]`.
    pub fn bind_arg(&self) -> String {
        let mut s = format!("{}:{}", self.host.display(), self.container.display());
        if self.read_only {
            s.push_str(":ro");
        }
        s
    }
}

/// Everything needed for one sibling-container execution.
#[derive(Debug, Clone)]
pub struct ContainerInvocation {
    /// Docker image to run.
    pub image: String,
    /// Bind mounts (host paths on the left).
    pub mounts: Vec<Mount>,
    /// Command arguments passed to the image entrypoint.
    pub args: Vec<String>,
    /// Environment variables (`KEY=value`).
    pub env: Vec<String>,
    /// Wall-clock limit for the container.
    pub timeout: Duration,
    /// Request GPU access. Passed through opaquely.
    pub use_gpu: bool,
    /// Memory limit in MB, when set. Passed through opaquely.
    pub memory_mb: Option<u64>,
    /// CPU cores, when set. Passed through opaquely.
    pub cpu_cores: Option<f64>,
}

impl ContainerInvocation {
    /// Creates a new invocation for the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            mounts: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: Duration::from_secs(6 * 3600),
            use_gpu: false,
            memory_mb: None,
            cpu_cores: None,
        }
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_gpu(mut self, use_gpu: bool) -> Self {
        self.use_gpu = use_gpu;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: Option<u64>) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_cpu_cores(mut self, cpu_cores: Option<f64>) -> Self {
        self.cpu_cores = cpu_cores;
        self
    }

    /// Bind strings for the engine, in declaration order.
    pub fn binds(&self) -> Vec<String> {
        self.mounts.iter().map(Mount::bind_arg).collect()
    }

    /// Human-readable command line, for log headers.
    pub fn describe(&self) -> String {
        format!("{} {}", self.image, self.args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_args() {
        let inv = ContainerInvocation::new("opensplat:latest")
            .with_mount(Mount::rw("/data/proj/runs/x", "/project"))
            .with_mount(Mount::ro("/data/proj/images", "/images"));

        assert_eq!(
            inv.binds(),
            vec![
                "/data/proj/runs/x:/project".to_string(),
                "/data/proj/images:/images:ro".to_string(),
            ]
        );
    }

    #[test]
    fn test_builder() {
        let inv = ContainerInvocation::new("opendronemap/odm:latest")
            .with_args(vec!["--project-path".into(), "/datasets".into()])
            .with_timeout(Duration::from_secs(60))
            .with_gpu(true)
            .with_memory_mb(Some(4096))
            .with_cpu_cores(Some(2.0));

        assert_eq!(inv.timeout, Duration::from_secs(60));
        assert!(inv.use_gpu);
        assert_eq!(inv.memory_mb, Some(4096));
        assert!(inv.describe().starts_with("opendronemap/odm:latest --project-path"));
    }
}
