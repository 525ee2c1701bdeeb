//! Container runtime backend. Loads saved image archives into Docker,
//! starts one container per agent with its port published on loopback,
//! and tears containers down when instances are retired.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::ImportImageOptions;
use bollard::models::{HostConfig, PortBinding, PortMap};
use bollard::Docker;
use bytes::Bytes;
use futures::TryStreamExt;
use runner_common::{Result, RunnerError};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Port agents listen on inside their container.
pub const AGENT_PORT: u16 = 8000;

/// Everything the runtime needs to start one agent container.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub cache_key: String,
    pub repo_tag: String,
    pub archive_path: PathBuf,
    pub host_port: u16,
    pub container_port: u16,
    /// Docker runtime name, e.g. `runsc` for gVisor. None uses the default.
    pub runtime: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartedContainer {
    pub container_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, spec: LaunchSpec) -> Result<StartedContainer>;
    async fn stop(&self, container_id: String) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to read image archive: {0}")]
    ArchiveRead(#[from] std::io::Error),
    #[error("Failed to load image archive: {0}")]
    LoadFailed(#[source] BollardError),
    #[error("Container creation failed: {0}")]
    CreationFailed(#[source] BollardError),
    #[error("Container start failed: {0}")]
    StartFailed(#[source] BollardError),
    #[error("Docker API error: {0}")]
    Api(#[from] BollardError),
}

impl From<RuntimeError> for RunnerError {
    fn from(e: RuntimeError) -> Self {
        RunnerError::InstanceStart(e.to_string())
    }
}

pub fn connect_docker() -> Result<Arc<Docker>> {
    let docker = Docker::connect_with_local_defaults()
        .map_err(|e| RunnerError::Config(format!("connecting to docker: {e}")))?;
    Ok(Arc::new(docker))
}

/// Runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    /// Loads the saved archive unless the daemon already has the tag.
    async fn ensure_image(&self, spec: &LaunchSpec) -> std::result::Result<(), RuntimeError> {
        match self.docker.inspect_image(&spec.repo_tag).await {
            Ok(_) => {
                debug!(repo_tag = %spec.repo_tag, "image already loaded");
                return Ok(());
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(RuntimeError::Api(e)),
        }

        info!(
            repo_tag = %spec.repo_tag,
            archive = %spec.archive_path.display(),
            "loading image archive into docker"
        );
        let bytes = tokio::fs::read(&spec.archive_path).await?;
        let options = ImportImageOptions {
            quiet: true,
            ..Default::default()
        };
        self.docker
            .import_image(options, Bytes::from(bytes), None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(RuntimeError::LoadFailed)?;
        Ok(())
    }
}

fn container_name(cache_key: &str) -> String {
    let prefix = cache_key.get(..12).unwrap_or(cache_key);
    let nonce = Uuid::new_v4().simple().to_string();
    let nonce = nonce.get(..8).unwrap_or(&nonce);
    format!("agent-{prefix}-{nonce}")
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(repo_tag = %spec.repo_tag, host_port = spec.host_port))]
    async fn start(&self, spec: LaunchSpec) -> Result<StartedContainer> {
        self.ensure_image(&spec).await.map_err(RunnerError::from)?;

        let name = container_name(&spec.cache_key);
        let exposed_port = format!("{}/tcp", spec.container_port);
        let mut port_bindings: PortMap = HashMap::new();
        port_bindings.insert(
            exposed_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(exposed_port, HashMap::new());

        let config = Config {
            image: Some(spec.repo_tag.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                runtime: spec.runtime.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(RuntimeError::CreationFailed)
            .map_err(RunnerError::from)?;

        if let Err(e) = self.docker.start_container::<String>(&created.id, None).await {
            warn!(container_id = %created.id, error = %e, "start failed, removing container");
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(RuntimeError::StartFailed(e).into());
        }

        info!(container_id = %created.id, name = %name, "container started");
        Ok(StartedContainer {
            container_id: created.id,
        })
    }

    async fn stop(&self, container_id: String) -> Result<()> {
        if let Err(e) = self
            .docker
            .stop_container(&container_id, Some(StopContainerOptions { t: 5 }))
            .await
        {
            warn!(%container_id, error = %e, "graceful stop failed, forcing removal");
        }
        self.docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| RunnerError::Internal(format!("removing container {container_id}: {e}")))?;
        debug!(%container_id, "container removed");
        Ok(())
    }
}

/// Polls the agent's HTTP endpoint until it answers or `overall` elapses.
/// Any response counts as ready, including error statuses from the agent's
/// own routes; readiness only means the listener is accepting requests.
pub async fn wait_for_ready(port: u16, poll_interval: Duration, overall: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .map_err(|e| RunnerError::Internal(format!("building readiness client: {e}")))?;
    let url = format!("http://127.0.0.1:{port}/");
    let started = Instant::now();

    let wait = async {
        loop {
            match client.get(&url).send().await {
                Ok(response) => {
                    debug!(
                        port,
                        status = response.status().as_u16(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "agent answered readiness probe"
                    );
                    return;
                }
                Err(e) => debug!(port, error = %e, "agent not ready yet"),
            }
            tokio::time::sleep(poll_interval).await;
        }
    };
    timeout(overall, wait).await.map_err(|_| {
        RunnerError::ReadinessTimeout(format!(
            "agent on port {port} not ready after {}ms",
            overall.as_millis()
        ))
    })
}
