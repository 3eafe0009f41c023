//! Docker Engine API wrapper using the bollard crate.
//!
//! The orchestrator talks to the engine through the shared socket, which is
//! the same channel the DooD deployment mounts into its container. Only the
//! capabilities the runner needs are exposed: container lifecycle, a
//! following log stream, image pulls, and a GPU probe.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::docker::invocation::ContainerInvocation;
use crate::error::DockerError;

/// Image used for the GPU availability probe; tiny and fast to pull.
const GPU_PROBE_IMAGE: &str = "alpine:latest";

/// CPU scheduler period used to express fractional core limits.
const CPU_PERIOD_US: i64 = 100_000;

/// Thin wrapper around the bollard client.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects to the local Docker daemon (the shared DooD socket).
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if the daemon is not
    /// reachable.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("failed to connect: {e}")))?;
        Ok(Self { docker })
    }

    /// Wraps an existing bollard instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Creates a container for the given invocation. Returns the container
    /// id; the container is not started.
    pub async fn create_container(
        &self,
        name: &str,
        invocation: &ContainerInvocation,
    ) -> Result<String, DockerError> {
        let device_requests = invocation.use_gpu.then(|| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let host_config = HostConfig {
            binds: {
                let binds = invocation.binds();
                (!binds.is_empty()).then_some(binds)
            },
            memory: invocation.memory_mb.map(|mb| (mb * 1024 * 1024) as i64),
            cpu_period: invocation.cpu_cores.map(|_| CPU_PERIOD_US),
            cpu_quota: invocation
                .cpu_cores
                .map(|cores| (cores * CPU_PERIOD_US as f64) as i64),
            device_requests,
            ..Default::default()
        };

        let config = Config {
            image: Some(invocation.image.clone()),
            cmd: (!invocation.args.is_empty()).then(|| invocation.args.clone()),
            env: (!invocation.env.is_empty()).then(|| invocation.env.clone()),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| DockerError::CreateFailed(e.to_string()))?;

        debug!(container = %response.id, image = %invocation.image, "container created");
        Ok(response.id)
    }

    /// Starts a container by id.
    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::RunFailed(format!("failed to start container: {e}")))
    }

    /// Stops a container: SIGTERM, then SIGKILL after `grace_secs`.
    pub async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<(), DockerError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: grace_secs }))
            .await
            .map_err(|e| DockerError::RunFailed(format!("failed to stop container: {e}")))
    }

    /// Removes a container, optionally by force.
    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| DockerError::RunFailed(format!("failed to remove container: {e}")))
    }

    /// Waits for a container to stop running; returns its exit code.
    pub async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // The wait endpoint reports a non-zero exit as an error payload
            // carrying the status code; surface what we can.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(DockerError::RunFailed(format!(
                "error waiting for container: {e}"
            ))),
            None => Err(DockerError::RunFailed(
                "container wait stream ended unexpectedly".to_string(),
            )),
        }
    }

    /// A following stream over the container's combined stdout/stderr.
    pub fn follow_logs(
        &self,
        id: &str,
    ) -> impl Stream<Item = Result<LogOutput, bollard::errors::Error>> + Unpin {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        };
        self.docker.logs(id, Some(options))
    }

    /// Checks whether an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Pulls an image from a registry.
    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| DockerError::PullFailed {
                image: image.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Ensures an image is present locally, pulling it when missing.
    pub async fn ensure_image(&self, image: &str) -> Result<(), DockerError> {
        if !self.image_exists(image).await {
            debug!(%image, "image not found locally, pulling");
            self.pull_image(image).await?;
        }
        Ok(())
    }

    /// Probes whether the engine can grant GPU access by running a minimal
    /// container with a GPU device request. Any failure means "no GPU";
    /// this never aborts a run.
    pub async fn probe_gpu(&self) -> bool {
        match self.run_gpu_probe().await {
            Ok(exit_code) => exit_code == 0,
            Err(e) => {
                warn!("GPU probe failed: {e}");
                false
            }
        }
    }

    async fn run_gpu_probe(&self) -> Result<i64, DockerError> {
        self.ensure_image(GPU_PROBE_IMAGE).await?;

        let invocation = ContainerInvocation::new(GPU_PROBE_IMAGE)
            .with_args(vec!["true".to_string()])
            .with_gpu(true);
        let name = format!("recon3d_gpu_probe_{}", std::process::id());
        let id = self.create_container(&name, &invocation).await?;

        let result = async {
            self.start_container(&id).await?;
            self.wait_container(&id).await
        }
        .await;

        let _ = self.remove_container(&id, true).await;
        result
    }
}

/// Engine operations the stage runner depends on. `DockerClient` is the
/// production implementation; tests substitute scripted fakes.
#[async_trait]
pub(crate) trait ContainerEngine: Send + Sync {
    async fn ensure_image(&self, image: &str) -> Result<(), DockerError>;

    async fn create_container(
        &self,
        name: &str,
        invocation: &ContainerInvocation,
    ) -> Result<String, DockerError>;

    async fn start_container(&self, id: &str) -> Result<(), DockerError>;

    async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<(), DockerError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError>;

    async fn wait_container(&self, id: &str) -> Result<i64, DockerError>;

    /// Raw combined stdout/stderr chunks, following until the container
    /// stops.
    fn output_stream(&self, id: &str) -> BoxStream<'static, Result<Vec<u8>, DockerError>>;

    async fn probe_gpu(&self) -> bool;
}

#[async_trait]
impl ContainerEngine for DockerClient {
    async fn ensure_image(&self, image: &str) -> Result<(), DockerError> {
        DockerClient::ensure_image(self, image).await
    }

    async fn create_container(
        &self,
        name: &str,
        invocation: &ContainerInvocation,
    ) -> Result<String, DockerError> {
        DockerClient::create_container(self, name, invocation).await
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        DockerClient::start_container(self, id).await
    }

    async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<(), DockerError> {
        DockerClient::stop_container(self, id, grace_secs).await
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        DockerClient::remove_container(self, id, force).await
    }

    async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        DockerClient::wait_container(self, id).await
    }

    fn output_stream(&self, id: &str) -> BoxStream<'static, Result<Vec<u8>, DockerError>> {
        self.follow_logs(id)
            .map(|chunk| match chunk {
                Ok(output) => Ok(output.into_bytes().to_vec()),
                Err(e) => Err(DockerError::RunFailed(format!("log stream error: {e}"))),
            })
            .boxed()
    }

    async fn probe_gpu(&self) -> bool {
        DockerClient::probe_gpu(self).await
    }
}
