//! Monitoring stack manager: a shared three-container stack (scraper +
//! dashboard + node-metrics exporter) under `monitoring/`, with a dynamic
//! `add_target`/`remove_target`/reload cycle for a long-lived shared stack.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::container::{ComposePlan, ComposeService, ContainerDriver, ContainerStatus};
use crate::datadir::DataDir;
use crate::error::NodeError;
use crate::fs_util::FsUtil;
use crate::model::MonitoringState;
use crate::package::options;

pub const SCRAPER_DEFAULT_PORT: u16 = 9090;
pub const DASHBOARD_DEFAULT_PORT: u16 = 3000;
pub const NODE_EXPORTER_DEFAULT_PORT: u16 = 9100;

pub const SCRAPER_IMAGE: &str = "prom/prometheus:latest";
pub const DASHBOARD_IMAGE: &str = "grafana/grafana:latest";
pub const NODE_EXPORTER_IMAGE: &str = "prom/node-exporter:latest";

const SCRAPER_CONTAINER: &str = "eigen-monitoring-scraper";
const DASHBOARD_CONTAINER: &str = "eigen-monitoring-dashboard";
const NODE_EXPORTER_CONTAINER: &str = "eigen-monitoring-node-exporter";
const MONITORING_NETWORK: &str = "eigen-monitoring";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PrometheusGlobal {
    scrape_interval: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StaticConfig {
    targets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ScrapeConfig {
    job_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics_path: Option<String>,
    static_configs: Vec<StaticConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PrometheusConfig {
    global: PrometheusGlobal,
    scrape_configs: Vec<ScrapeConfig>,
}

/// Derive a stable, endpoint-keyed job name: lets `add_target`/
/// `remove_target` dedupe purely by endpoint string, silently coalescing
/// duplicate endpoints.
fn job_name_for(endpoint: &str) -> String {
    format!("avs-{}", endpoint.replace(['.', ':', '/'], "-"))
}

/// Probe-assign a free TCP port on localhost: bind to port 0, read back
/// what the OS picked, release the listener immediately.
fn probe_free_port() -> Result<u16, NodeError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to probe a free port")))?;
    listener
        .local_addr()
        .map(|a| a.port())
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read probed port")))
}

/// Lifecycles the shared monitoring stack under `<data_root>/monitoring/`.
pub struct MonitoringManager {
    data_dir: DataDir,
    driver: ContainerDriver,
    http: reqwest::Client,
}

impl MonitoringManager {
    pub fn new(data_dir: DataDir, driver: ContainerDriver) -> Self {
        Self { data_dir, driver, http: reqwest::Client::new() }
    }

    fn compose_path(dir: &std::path::Path) -> PathBuf {
        dir.join("docker-compose.yml")
    }

    fn env_path(dir: &std::path::Path) -> PathBuf {
        dir.join(".env")
    }

    fn prometheus_config_path(dir: &std::path::Path) -> PathBuf {
        dir.join("prometheus").join("prometheus.yml")
    }

    fn is_installed(dir: &std::path::Path) -> bool {
        Self::compose_path(dir).is_file()
    }

    /// `install()`: idempotent. If already installed, no-op returning the
    /// existing container names.
    pub async fn install(&self) -> Result<Vec<String>, NodeError> {
        tracing::info!("installing monitoring stack");
        let (dir, mut locker) = self.data_dir.monitoring_stack().await?;
        locker.lock()?;
        let result = self.install_locked(&dir).await;
        locker.unlock()?;
        if result.is_ok() {
            tracing::info!("monitoring stack installed");
        }
        result
    }

    async fn install_locked(&self, dir: &std::path::Path) -> Result<Vec<String>, NodeError> {
        let names = vec![
            SCRAPER_CONTAINER.to_string(),
            DASHBOARD_CONTAINER.to_string(),
            NODE_EXPORTER_CONTAINER.to_string(),
        ];

        if Self::is_installed(dir) {
            return Ok(names);
        }

        let scraper_port = probe_free_port()?;
        let dashboard_port = probe_free_port()?;
        let node_exporter_port = probe_free_port()?;

        let mut env: BTreeMap<String, String> = BTreeMap::new();
        env.insert("SCRAPER_PORT".to_string(), scraper_port.to_string());
        env.insert("DASHBOARD_PORT".to_string(), dashboard_port.to_string());
        env.insert("NODE_EXPORTER_PORT".to_string(), node_exporter_port.to_string());
        env.insert("GF_SECURITY_ADMIN_USER".to_string(), "admin".to_string());
        env.insert("GF_SECURITY_ADMIN_PASSWORD".to_string(), "admin".to_string());
        FsUtil::atomic_write(&Self::env_path(dir), options::format_dotenv(&env).as_bytes())
            .await
            .map_err(|e| NodeError::External(e.context("failed to write monitoring .env")))?;

        let prometheus_dir = dir.join("prometheus");
        tokio::fs::create_dir_all(&prometheus_dir)
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to create prometheus config dir")))?;

        let config = PrometheusConfig {
            global: PrometheusGlobal { scrape_interval: "15s".to_string() },
            scrape_configs: vec![
                ScrapeConfig {
                    job_name: "prometheus".to_string(),
                    metrics_path: None,
                    static_configs: vec![StaticConfig {
                        targets: vec![format!("localhost:{SCRAPER_DEFAULT_PORT}")],
                        labels: BTreeMap::new(),
                    }],
                },
                ScrapeConfig {
                    job_name: "node-metrics-exporter".to_string(),
                    metrics_path: None,
                    static_configs: vec![StaticConfig {
                        targets: vec![format!("{NODE_EXPORTER_CONTAINER}:{NODE_EXPORTER_DEFAULT_PORT}")],
                        labels: BTreeMap::new(),
                    }],
                },
            ],
        };
        self.write_prometheus_config(dir, &config).await?;

        let datasource_dir = dir.join("grafana/provisioning/datasources");
        tokio::fs::create_dir_all(&datasource_dir)
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to create grafana datasource dir")))?;
        let datasource = format!(
            "apiVersion: 1\ndatasources:\n  - name: Prometheus\n    type: prometheus\n    access: proxy\n    url: http://{SCRAPER_CONTAINER}:{SCRAPER_DEFAULT_PORT}\n    isDefault: true\n    editable: true\n"
        );
        tokio::fs::write(datasource_dir.join("prometheus.yml"), datasource)
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to write grafana datasource")))?;

        let compose_path = Self::compose_path(dir);
        let plan = self.build_compose_plan();
        let rendered = serde_yaml::to_string(&plan)
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to render monitoring compose plan")))?;
        FsUtil::atomic_write(&compose_path, rendered.as_bytes())
            .await
            .map_err(|e| NodeError::External(e.context("failed to write monitoring compose plan")))?;

        self.driver.create(&compose_path).await?;
        self.driver.up(&compose_path).await?;

        Ok(names)
    }

    fn build_compose_plan(&self) -> ComposePlan {
        let mut services = std::collections::BTreeMap::new();
        services.insert(
            "scraper".to_string(),
            ComposeService {
                image: SCRAPER_IMAGE.to_string(),
                container_name: Some(SCRAPER_CONTAINER.to_string()),
                ports: vec![format!("${{SCRAPER_PORT}}:{SCRAPER_DEFAULT_PORT}")],
                volumes: vec!["./prometheus/prometheus.yml:/etc/prometheus/prometheus.yml:ro".to_string()],
                command: Some(vec![
                    "--config.file=/etc/prometheus/prometheus.yml".to_string(),
                    "--web.enable-lifecycle".to_string(),
                ]),
                networks: vec![MONITORING_NETWORK.to_string()],
                ..Default::default()
            },
        );
        services.insert(
            "dashboard".to_string(),
            ComposeService {
                image: DASHBOARD_IMAGE.to_string(),
                container_name: Some(DASHBOARD_CONTAINER.to_string()),
                ports: vec![format!("${{DASHBOARD_PORT}}:{DASHBOARD_DEFAULT_PORT}")],
                volumes: vec!["./grafana/provisioning:/etc/grafana/provisioning:ro".to_string()],
                environment: vec![
                    "GF_SECURITY_ADMIN_USER=${GF_SECURITY_ADMIN_USER}".to_string(),
                    "GF_SECURITY_ADMIN_PASSWORD=${GF_SECURITY_ADMIN_PASSWORD}".to_string(),
                ],
                networks: vec![MONITORING_NETWORK.to_string()],
                ..Default::default()
            },
        );
        services.insert(
            "node_exporter".to_string(),
            ComposeService {
                image: NODE_EXPORTER_IMAGE.to_string(),
                container_name: Some(NODE_EXPORTER_CONTAINER.to_string()),
                ports: vec![format!("${{NODE_EXPORTER_PORT}}:{NODE_EXPORTER_DEFAULT_PORT}")],
                networks: vec![MONITORING_NETWORK.to_string()],
                ..Default::default()
            },
        );

        let mut networks = std::collections::BTreeMap::new();
        networks.insert(MONITORING_NETWORK.to_string(), serde_yaml::Value::Null);

        ComposePlan { services, networks }
    }

    async fn write_prometheus_config(&self, dir: &std::path::Path, config: &PrometheusConfig) -> Result<(), NodeError> {
        let rendered = serde_yaml::to_string(config)
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to render prometheus.yml")))?;
        FsUtil::atomic_write(&Self::prometheus_config_path(dir), rendered.as_bytes())
            .await
            .map_err(|e| NodeError::External(e.context("failed to write prometheus.yml")))
    }

    async fn read_prometheus_config(&self, dir: &std::path::Path) -> Result<PrometheusConfig, NodeError> {
        let path = Self::prometheus_config_path(dir);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read prometheus.yml")))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to parse prometheus.yml")))
    }

    async fn scraper_admin_url(&self, dir: &std::path::Path) -> Result<String, NodeError> {
        let contents = tokio::fs::read_to_string(Self::env_path(dir))
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read monitoring .env")))?;
        let env = options::parse_dotenv(&contents);
        let port = env
            .get("SCRAPER_PORT")
            .ok_or_else(|| NodeError::External(anyhow::anyhow!("monitoring .env missing SCRAPER_PORT")))?;
        Ok(format!("http://localhost:{port}"))
    }

    /// `status()`: `InstalledRunning` iff all three service containers are
    /// running or restarting; `InstalledStopped` iff all are stopped;
    /// anything else (a partial start, a missing container) is `Broken`.
    pub async fn status(&self) -> Result<MonitoringState, NodeError> {
        let dir = self.data_dir.root().join("monitoring");
        if !Self::is_installed(&dir) {
            return Ok(MonitoringState::NotInstalled);
        }

        let mut statuses = Vec::new();
        for name in [SCRAPER_CONTAINER, DASHBOARD_CONTAINER, NODE_EXPORTER_CONTAINER] {
            statuses.push(self.driver.container_status(name).await?);
        }

        if statuses.iter().all(|s| matches!(s, ContainerStatus::Running | ContainerStatus::Restarting)) {
            Ok(MonitoringState::InstalledRunning)
        } else if statuses.iter().all(|s| *s == ContainerStatus::Stopped) {
            Ok(MonitoringState::InstalledStopped)
        } else {
            Ok(MonitoringState::Broken)
        }
    }

    /// `add_target(endpoint, path, instance_id, docker_network)`.
    pub async fn add_target(&self, endpoint: &str, path: &str, instance_id: &str, docker_network: &str) -> Result<(), NodeError> {
        tracing::debug!(endpoint, path, instance_id, "adding monitoring target");
        for name in [SCRAPER_CONTAINER, DASHBOARD_CONTAINER, NODE_EXPORTER_CONTAINER] {
            self.driver.network_connect(docker_network, name).await?;
        }

        let (dir, mut locker) = self.data_dir.monitoring_stack().await?;
        locker.lock()?;
        let result = self.add_target_locked(&dir, endpoint, path, instance_id).await;
        locker.unlock()?;
        result
    }

    async fn add_target_locked(&self, dir: &std::path::Path, endpoint: &str, path: &str, instance_id: &str) -> Result<(), NodeError> {
        let mut config = self.read_prometheus_config(dir).await?;
        let job_name = job_name_for(endpoint);

        if config.scrape_configs.iter().any(|c| c.job_name == job_name) {
            return Ok(());
        }

        config.scrape_configs.push(ScrapeConfig {
            job_name: job_name.clone(),
            metrics_path: Some(path.to_string()),
            static_configs: vec![StaticConfig {
                targets: vec![endpoint.to_string()],
                labels: BTreeMap::from([("instanceID".to_string(), instance_id.to_string())]),
            }],
        });

        self.write_prometheus_config(dir, &config).await?;
        self.reload(dir).await
    }

    /// `remove_target(endpoint, docker_network)`.
    pub async fn remove_target(&self, endpoint: &str, docker_network: &str) -> Result<(), NodeError> {
        tracing::debug!(endpoint, "removing monitoring target");
        let (dir, mut locker) = self.data_dir.monitoring_stack().await?;
        locker.lock()?;
        let result = self.remove_target_locked(&dir, endpoint).await;
        locker.unlock()?;
        result?;

        for name in [SCRAPER_CONTAINER, DASHBOARD_CONTAINER, NODE_EXPORTER_CONTAINER] {
            self.driver.network_disconnect(docker_network, name).await?;
        }

        Ok(())
    }

    async fn remove_target_locked(&self, dir: &std::path::Path, endpoint: &str) -> Result<(), NodeError> {
        let mut config = self.read_prometheus_config(dir).await?;
        let job_name = job_name_for(endpoint);

        let before = config.scrape_configs.len();
        config.scrape_configs.retain(|c| c.job_name != job_name);
        if config.scrape_configs.len() == before {
            return Err(NodeError::NonexistingEndpoint { endpoint: endpoint.to_string() });
        }

        self.write_prometheus_config(dir, &config).await?;
        self.reload(dir).await
    }

    async fn reload(&self, dir: &std::path::Path) -> Result<(), NodeError> {
        let admin_url = self.scraper_admin_url(dir).await?;
        let response = self
            .http
            .post(format!("{admin_url}/-/reload"))
            .send()
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to reach scraper reload endpoint")))?;
        if response.status().as_u16() != 200 {
            return Err(NodeError::ReloadFailed { status: response.status().as_u16() });
        }
        Ok(())
    }

    /// `cleanup(force)`: `force` bypasses the lock and the compose `down`
    /// call entirely, just removing the directory — for when state is too
    /// broken for `down` itself to succeed.
    pub async fn cleanup(&self, force: bool) -> Result<(), NodeError> {
        tracing::info!(force, "cleaning up monitoring stack");
        let dir = self.data_dir.root().join("monitoring");
        if !dir.is_dir() {
            return Ok(());
        }

        if force {
            return FsUtil::remove_dir_if_exists(&dir)
                .await
                .map_err(|e| NodeError::External(e.context("failed to remove monitoring directory")));
        }

        let (dir, mut locker) = self.data_dir.monitoring_stack().await?;
        locker.lock()?;
        let compose_path = Self::compose_path(&dir);
        if compose_path.is_file() {
            self.driver.down(&compose_path).await?;
        }
        locker.unlock()?;
        FsUtil::remove_dir_if_exists(&dir)
            .await
            .map_err(|e| NodeError::External(e.context("failed to remove monitoring directory")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_name_is_stable_per_endpoint() {
        assert_eq!(job_name_for("10.0.0.5:8080"), job_name_for("10.0.0.5:8080"));
        assert_ne!(job_name_for("10.0.0.5:8080"), job_name_for("10.0.0.6:8080"));
    }

    #[test]
    fn probe_free_port_returns_a_bindable_port() {
        let port = probe_free_port().unwrap();
        assert!(port > 0);
    }

    #[test]
    fn add_then_remove_target_is_a_pure_config_round_trip() {
        let mut config = PrometheusConfig {
            global: PrometheusGlobal { scrape_interval: "15s".to_string() },
            scrape_configs: vec![ScrapeConfig {
                job_name: "prometheus".to_string(),
                metrics_path: None,
                static_configs: vec![StaticConfig { targets: vec!["localhost:9090".to_string()], labels: BTreeMap::new() }],
            }],
        };
        let before = config.clone();

        let job_name = job_name_for("10.0.0.9:8080");
        config.scrape_configs.push(ScrapeConfig {
            job_name: job_name.clone(),
            metrics_path: Some("/eigen/node/metrics".to_string()),
            static_configs: vec![StaticConfig {
                targets: vec!["10.0.0.9:8080".to_string()],
                labels: BTreeMap::from([("instanceID".to_string(), "mock-avs-default".to_string())]),
            }],
        });
        config.scrape_configs.retain(|c| c.job_name != job_name);

        assert_eq!(config, before);
    }
}
