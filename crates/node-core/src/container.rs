//! Container driver: a compose-plan runner and raw container launcher over
//! the Docker Engine API, running whatever services a rendered
//! `docker-compose.yml` declares.

use std::collections::HashMap;
use std::path::Path;

use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions};
use bollard::secret::{EndpointSettings, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

fn wrap(context: &'static str) -> impl Fn(bollard::errors::Error) -> NodeError {
    move |e| NodeError::External(anyhow::anyhow!(e).context(context))
}

/// Minimal compose-plan schema: service name -> service spec, plus
/// top-level named networks. Rendered by the orchestration engine from a
/// profile's compose template; not a general docker-compose parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposePlan {
    pub services: std::collections::BTreeMap<String, ComposeService>,
    #[serde(default)]
    pub networks: std::collections::BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeService {
    pub image: String,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
}

impl ComposePlan {
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context(format!("failed to read {}", path.display()))))?;
        serde_yaml::from_str(&contents).map_err(|e| NodeError::InvalidConf {
            problems: vec![format!("failed to parse compose plan {}: {}", path.display(), e)],
        })
    }

    fn service_name(&self, key: &str, service: &ComposeService) -> String {
        service.container_name.clone().unwrap_or_else(|| key.to_string())
    }
}

/// Options for a one-off ephemeral container run (plugin invocations,
/// backup/restore snapshotter runs).
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub args: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub auto_remove: bool,
    pub mounts: Vec<(String, String)>,
    pub volumes_from: Vec<String>,
    pub network: Option<String>,
    pub host_network: bool,
    pub container_name: Option<String>,
    pub env: Vec<String>,
}

pub struct RunResult {
    pub container_id: String,
    pub exit_code: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Restarting,
    Stopped,
    Missing,
}

#[derive(Clone)]
pub struct ContainerDriver {
    docker: Docker,
}

impl ContainerDriver {
    pub fn connect() -> Result<Self, NodeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to connect to the container engine")))?;
        Ok(Self { docker })
    }

    async fn ensure_network(&self, name: &str) -> Result<(), NodeError> {
        if self.docker.inspect_network::<String>(name, None).await.is_ok() {
            return Ok(());
        }
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                check_duplicate: true,
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .map_err(wrap("failed to create network"))?;
        Ok(())
    }

    fn to_container_config(&self, service: &ComposeService) -> Config<String> {
        let host_config = HostConfig {
            binds: (!service.volumes.is_empty()).then(|| service.volumes.clone()),
            ..Default::default()
        };
        Config {
            image: Some(service.image.clone()),
            env: (!service.environment.is_empty()).then(|| service.environment.clone()),
            cmd: service.command.clone(),
            entrypoint: service.entrypoint.clone(),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// `create(path)`: parse the compose plan and create (but not start)
    /// every declared container, wiring declared networks.
    pub async fn create(&self, compose_path: &Path) -> Result<Vec<String>, NodeError> {
        let plan = ComposePlan::load(compose_path)?;
        for network in plan.networks.keys() {
            self.ensure_network(network).await?;
        }

        let mut created = Vec::new();
        for (key, service) in &plan.services {
            let name = plan.service_name(key, service);
            self.ensure_image_pulled(&service.image).await?;
            let config = self.to_container_config(service);
            let container = self
                .docker
                .create_container(Some(CreateContainerOptions { name: name.clone(), ..Default::default() }), config)
                .await
                .map_err(wrap("failed to create container"))?;
            for network in &service.networks {
                self.network_connect(network, &name).await?;
            }
            created.push(container.id);
        }
        Ok(created)
    }

    /// `up(path)`: `create` if needed, then start every service. Idempotent.
    pub async fn up(&self, compose_path: &Path) -> Result<Vec<String>, NodeError> {
        let plan = ComposePlan::load(compose_path)?;
        let mut started = Vec::new();
        for (key, service) in &plan.services {
            let name = plan.service_name(key, service);
            if self.docker.inspect_container(&name, None).await.is_err() {
                self.create(compose_path).await?;
                break;
            }
        }
        for (key, service) in &plan.services {
            let name = plan.service_name(key, service);
            self.docker
                .start_container(&name, None::<StartContainerOptions<String>>)
                .await
                .or_else(|e| if is_already_started(&e) { Ok(()) } else { Err(e) })
                .map_err(wrap("failed to start container"))?;
            started.push(name);
        }
        Ok(started)
    }

    /// `stop(path)`: stop every service container, leaving it in place.
    pub async fn stop(&self, compose_path: &Path) -> Result<(), NodeError> {
        let plan = ComposePlan::load(compose_path)?;
        for (key, service) in &plan.services {
            let name = plan.service_name(key, service);
            self.docker
                .stop_container(&name, Some(StopContainerOptions { t: 10 }))
                .await
                .ok();
        }
        Ok(())
    }

    /// `down(path)`: stop and remove every service container.
    pub async fn down(&self, compose_path: &Path) -> Result<(), NodeError> {
        let plan = ComposePlan::load(compose_path)?;
        for (key, service) in &plan.services {
            let name = plan.service_name(key, service);
            self.docker
                .stop_container(&name, Some(StopContainerOptions { t: 10 }))
                .await
                .ok();
            self.docker
                .remove_container(&name, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                .await
                .ok();
        }
        Ok(())
    }

    /// `run(image, opts)`: launch a single ephemeral container, optionally
    /// `--volumes-from` another container, joined to a docker network
    /// unless `host_network` is set. Returns once the container exits.
    pub async fn run(&self, image: &str, opts: RunOptions) -> Result<RunResult, NodeError> {
        self.ensure_image_pulled(image).await?;

        let name = opts
            .container_name
            .clone()
            .unwrap_or_else(|| format!("eigen-run-{}", names::Generator::default().next().unwrap_or_default()));

        let binds: Vec<String> = opts
            .mounts
            .iter()
            .map(|(host, container)| format!("{host}:{container}"))
            .collect();

        let host_config = HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            volumes_from: (!opts.volumes_from.is_empty()).then(|| opts.volumes_from.clone()),
            auto_remove: opts.auto_remove.then_some(true),
            network_mode: if opts.host_network {
                Some("host".to_string())
            } else {
                opts.network.clone()
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            cmd: (!opts.args.is_empty()).then_some(opts.args.clone()),
            entrypoint: opts.entrypoint.clone(),
            env: (!opts.env.is_empty()).then_some(opts.env.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(Some(CreateContainerOptions { name: name.clone(), ..Default::default() }), config)
            .await
            .map_err(wrap("failed to create run container"))?;

        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(wrap("failed to start run container"))?;

        let mut wait_stream = self
            .docker
            .wait_container(&container.id, None::<bollard::container::WaitContainerOptions<String>>);
        let exit_code = match wait_stream.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(e)) => return Err(wrap("container wait failed")(e)),
            None => 0,
        };

        Ok(RunResult { container_id: container.id, exit_code })
    }

    pub async fn container_inspect(&self, name: &str) -> Result<bollard::secret::ContainerInspectResponse, NodeError> {
        self.docker
            .inspect_container(name, None)
            .await
            .map_err(wrap("failed to inspect container"))
    }

    /// The container's IP on the given network, if connected.
    pub async fn container_ip(&self, name: &str, network: &str) -> Result<Option<String>, NodeError> {
        let inspect = self.container_inspect(name).await?;
        let ip = inspect
            .network_settings
            .and_then(|ns| ns.networks)
            .and_then(|networks| networks.get(network).cloned())
            .and_then(|endpoint: EndpointSettings| endpoint.ip_address)
            .filter(|ip| !ip.is_empty());
        Ok(ip)
    }

    pub async fn container_status(&self, name: &str) -> Result<ContainerStatus, NodeError> {
        match self.docker.inspect_container(name, None).await {
            Ok(inspect) => {
                let running = inspect.state.as_ref().and_then(|s| s.running).unwrap_or(false);
                let restarting = inspect.state.as_ref().and_then(|s| s.restarting).unwrap_or(false);
                Ok(if restarting {
                    ContainerStatus::Restarting
                } else if running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Stopped
                })
            }
            Err(_) => Ok(ContainerStatus::Missing),
        }
    }

    /// Idempotent: connecting an already-connected container is a no-op.
    pub async fn network_connect(&self, network: &str, container: &str) -> Result<(), NodeError> {
        self.ensure_network(network).await?;
        let result = self
            .docker
            .connect_network(network, ConnectNetworkOptions { container, ..Default::default() })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("already exists") => Ok(()),
            Err(e) => Err(wrap("failed to connect container to network")(e)),
        }
    }

    pub async fn network_disconnect(&self, network: &str, container: &str) -> Result<(), NodeError> {
        let result = self
            .docker
            .disconnect_network(network, DisconnectNetworkOptions { container, force: true })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("is not connected") => Ok(()),
            Err(e) => Err(wrap("failed to disconnect container from network")(e)),
        }
    }

    /// Build an image from a directory (a cloned remote-git-context or an
    /// extracted local-archive-context), tagged `tag`.
    pub async fn build_from_uri(&self, context_dir: &Path, tag: &str) -> Result<String, NodeError> {
        let tar_bytes = Self::tar_directory(context_dir)?;

        let build_options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(build_options, None, Some(tar_bytes.into()));
        while let Some(result) = stream.next().await {
            let info = result.map_err(wrap("docker build error"))?;
            if let Some(error) = &info.error {
                return Err(NodeError::External(anyhow::anyhow!("docker build failed: {error}")));
            }
        }
        Ok(tag.to_string())
    }

    fn tar_directory(dir: &Path) -> Result<Vec<u8>, NodeError> {
        let mut buffer = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut buffer);
            builder
                .append_dir_all(".", dir)
                .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to tar build context")))?;
            builder
                .finish()
                .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to finish build context tar")))?;
        }
        Ok(buffer)
    }

    pub async fn image_exists(&self, image_ref: &str) -> Result<bool, NodeError> {
        Ok(self.docker.inspect_image(image_ref).await.is_ok())
    }

    async fn ensure_image_pulled(&self, image_ref: &str) -> Result<(), NodeError> {
        if self.docker.inspect_image(image_ref).await.is_ok() {
            return Ok(());
        }
        let (image, tag) = image_ref.rsplit_once(':').unwrap_or((image_ref, "latest"));
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions { from_image: image.to_string(), tag: tag.to_string(), ..Default::default() }),
            None,
            None,
        );
        while let Some(result) = stream.next().await {
            result.map_err(wrap("failed to pull image"))?;
        }
        Ok(())
    }
}

fn is_already_started(e: &bollard::errors::Error) -> bool {
    e.to_string().contains("already started")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn compose_plan_parses_minimal_yaml() {
        let dir = TempDir::new("compose").unwrap();
        let path = dir.path().join("docker-compose.yml");
        std::fs::write(
            &path,
            r#"
services:
  avs:
    image: mock-avs:v1.0.0
    environment:
      - FOO=bar
    ports:
      - "8080:8080"
networks:
  default: {}
"#,
        )
        .unwrap();
        let plan = ComposePlan::load(&path).unwrap();
        assert_eq!(plan.services.len(), 1);
        assert_eq!(plan.services["avs"].image, "mock-avs:v1.0.0");
    }

    #[test]
    fn compose_plan_rejects_malformed_yaml() {
        let dir = TempDir::new("compose").unwrap();
        let path = dir.path().join("docker-compose.yml");
        std::fs::write(&path, "services: [this, is, not, a, map]").unwrap();
        assert!(ComposePlan::load(&path).is_err());
    }

    #[test]
    fn service_name_defaults_to_key_without_container_name() {
        let plan = ComposePlan::default();
        let service = ComposeService { image: "x".into(), ..Default::default() };
        assert_eq!(plan.service_name("avs", &service), "avs");
    }
}
