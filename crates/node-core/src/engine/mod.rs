//! Orchestration engine: the container-lifecycle state machine. Every
//! top-level operation runs as a transaction over a
//! [`CompensationStack`](compensation::CompensationStack): fetch -> render
//! -> create -> start -> verify, unwinding whatever already succeeded if a
//! later step fails.

pub mod compensation;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use backon::{ExponentialBuilder, Retryable};
use semver::Version;
use sha2::{Digest, Sha256};

use crate::container::{ComposePlan, ContainerDriver, RunOptions};
use crate::datadir::DataDir;
use crate::error::NodeError;
use crate::fs_util::FsUtil;
use crate::model::{
    BackupId, Instance, InstanceMonitoring, InstancePlugin, InstanceState, MonitoringTarget, MonitoringState, PluginKind, PluginSpec,
};
use crate::monitoring::MonitoringManager;
use crate::package::git::GitAuth;
use crate::package::{options, Package, PackageHandler};
use compensation::CompensationStack;

const SNAPSHOTTER_IMAGE: &str = "eigen-snapshotter:latest";
const SNAPSHOTTER_BUILD_CONTEXT: &str = "https://github.com/eigenlayer/avs-node-snapshotter.git";

/// How a requested version is selected for `install`/`update`.
#[derive(Debug, Clone)]
pub enum VersionSelector {
    Latest,
    Tag(String),
    Commit(String),
}

/// Where the package comes from for `install`.
#[derive(Debug, Clone)]
pub enum InstallSource {
    Remote(String),
    Local(PathBuf),
}

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub source: InstallSource,
    pub profile: String,
    pub tag: String,
    pub option_values: BTreeMap<String, String>,
    pub run_after: bool,
    pub version: VersionSelector,
    pub auth: Option<GitAuth>,
}

/// Where the new package content comes from for `update`.
#[derive(Debug, Clone)]
pub enum UpdateSource {
    Remote { url: String, auth: Option<GitAuth> },
    Local(PathBuf),
}

pub struct OrchestrationEngine {
    data_dir: DataDir,
    driver: ContainerDriver,
    monitoring: MonitoringManager,
    health_client: reqwest::Client,
}

impl OrchestrationEngine {
    pub fn new(data_dir: DataDir, driver: ContainerDriver) -> Self {
        let monitoring = MonitoringManager::new(data_dir.clone(), driver.clone());
        Self { data_dir, driver, monitoring, health_client: reqwest::Client::new() }
    }

    pub fn monitoring(&self) -> &MonitoringManager {
        &self.monitoring
    }

    fn scratch_key(source: &str) -> String {
        hex::encode(Sha256::digest(source.as_bytes()))
    }

    /// `install(source, profile, tag, option_values, run_after, version)`.
    /// Every fallible step after the temp dir is acquired pushes its undo
    /// onto `stack`; on any failure the stack unwinds once, in full,
    /// before the error is returned.
    pub async fn install(&self, req: InstallRequest) -> Result<String, NodeError> {
        tracing::info!(profile = %req.profile, tag = %req.tag, "starting install");
        let mut stack = CompensationStack::new();
        match self.install_steps(&req, &mut stack).await {
            Ok(id) => {
                stack.commit();
                tracing::info!(instance_id = %id, "install complete");
                Ok(id)
            }
            Err(e) => {
                tracing::warn!(error = ?e, "install failed, unwinding compensation stack");
                stack.unwind().await;
                Err(e)
            }
        }
    }

    async fn install_steps(&self, req: &InstallRequest, stack: &mut CompensationStack) -> Result<String, NodeError> {
        let source_key = match &req.source {
            InstallSource::Remote(url) => url.clone(),
            InstallSource::Local(path) => path.display().to_string(),
        };
        let temp_id = Self::scratch_key(&source_key);
        let temp_path = self.data_dir.init_temp(&temp_id).await?;
        self.push_temp_cleanup(stack, &temp_id);

        let mut pkg = self.fetch_or_local(&req.source, req.auth.as_ref(), &temp_path)?;
        if let InstallSource::Remote(_) = req.source {
            let selector = self.resolve_version_selector(&pkg, &req.version)?;
            PackageHandler::checkout(&mut pkg, &selector)?;
        }

        let (manifest, profiles) = PackageHandler::profiles(&pkg)?;
        let profile = PackageHandler::find_profile(&profiles, &req.profile)?;
        let rendered_env = PackageHandler::render_dotenv(&pkg, profile, &req.option_values)?;

        let instance_id = format!("{}-{}", manifest.name, req.tag);
        if self.data_dir.has_instance(&instance_id) {
            return Err(NodeError::DuplicateInstance { id: instance_id });
        }

        let plugin_spec = PackageHandler::plugin_spec(&manifest, profile, &instance_id);
        let instance_plugin = self.stage_plugin(&pkg, &plugin_spec, &instance_id, stack)?;

        let instance = Instance {
            name: manifest.name.clone(),
            url: source_key,
            version: pkg.checked_out.clone().unwrap_or_else(|| "local".to_string()),
            profile: profile.name.clone(),
            tag: req.tag.clone(),
            monitoring: InstanceMonitoring {
                targets: profile.monitoring.targets.iter().cloned().map(MonitoringTarget::from).collect(),
            },
            api_target: MonitoringTarget::from(profile.api_target.clone()),
            plugin: instance_plugin,
            commit: pkg.checked_out.clone().unwrap_or_default(),
        };

        self.data_dir.init_instance(&instance).await?;
        self.push_instance_removal(stack, &instance_id);

        let instance_path = self.data_dir.instance_path(&instance_id);
        self.stage_instance_files(&pkg, &profile.name, &instance_path, &rendered_env).await?;

        let compose_path = instance_path.join("docker-compose.yml");
        self.driver.create(&compose_path).await?;

        let plan = ComposePlan::load(&compose_path)?;
        self.register_monitoring_targets(&plan, &instance, &instance_id).await?;

        if req.run_after {
            self.driver.up(&compose_path).await?;
            self.poll_health(&plan, &instance).await?;
        }

        // Scratch dir is keyed deterministically off the source, so it must
        // be cleared here on the success path too; compensation only runs
        // it on failure (commit() drops the stack without running anything),
        // and a second install from the same source would otherwise hit
        // `TempDirAlreadyExists` before ever reaching the real checks.
        let _ = self.data_dir.remove_temp(&temp_id).await;

        Ok(instance_id)
    }

    fn push_temp_cleanup(&self, stack: &mut CompensationStack, temp_id: &str) {
        let data_dir = self.data_dir.clone();
        let temp_id = temp_id.to_string();
        stack.push(Box::pin(async move {
            let _ = data_dir.remove_temp(&temp_id).await;
        }));
    }

    fn push_instance_removal(&self, stack: &mut CompensationStack, instance_id: &str) {
        let data_dir = self.data_dir.clone();
        let id = instance_id.to_string();
        stack.push(Box::pin(async move {
            let _ = data_dir.remove_instance(&id).await;
        }));
    }

    fn fetch_or_local(&self, source: &InstallSource, auth: Option<&GitAuth>, scratch_dir: &Path) -> Result<Package, NodeError> {
        let pkg = match source {
            InstallSource::Remote(url) => PackageHandler::fetch(url, auth, scratch_dir)?,
            InstallSource::Local(path) => PackageHandler::local(path),
        };
        PackageHandler::verify(&pkg)?;
        Ok(pkg)
    }

    fn resolve_version_selector(&self, pkg: &Package, version: &VersionSelector) -> Result<String, NodeError> {
        Ok(match version {
            VersionSelector::Latest => {
                let latest = PackageHandler::latest(pkg)?.ok_or(NodeError::NoVersions)?;
                format!("v{latest}")
            }
            VersionSelector::Tag(tag) => tag.clone(),
            VersionSelector::Commit(commit) => commit.clone(),
        })
    }

    /// Extract a `local-archive-context` plugin's referenced subtree into
    /// `plugin/<instance_id>.tar`, pushing its removal onto `stack`.
    /// Non-local plugin kinds need no staging.
    fn stage_plugin(
        &self,
        pkg: &Package,
        plugin_spec: &Option<PluginSpec>,
        instance_id: &str,
        stack: &mut CompensationStack,
    ) -> Result<Option<InstancePlugin>, NodeError> {
        match plugin_spec {
            Some(PluginSpec::LocalArchiveContext(subpath)) => {
                let archive_path = self.data_dir.plugin_archive_path(instance_id);
                if let Some(parent) = archive_path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to create plugin directory")))?;
                }
                tar_dir_to_file(&pkg.pkg_root().join(subpath), &archive_path)?;
                let data_dir = self.data_dir.clone();
                let id = instance_id.to_string();
                stack.push(Box::pin(async move {
                    let _ = tokio::fs::remove_file(data_dir.plugin_archive_path(&id)).await;
                }));
                Ok(Some(InstancePlugin { kind: PluginKind::LocalArchiveContext, src: instance_id.to_string() }))
            }
            Some(PluginSpec::RemoteGitContext(src)) => Ok(Some(InstancePlugin { kind: PluginKind::RemoteGitContext, src: src.clone() })),
            Some(PluginSpec::PreBuiltImage(src)) => Ok(Some(InstancePlugin { kind: PluginKind::PreBuiltImage, src: src.clone() })),
            None => Ok(None),
        }
    }

    async fn stage_instance_files(
        &self,
        pkg: &Package,
        profile_name: &str,
        instance_path: &Path,
        rendered_env: &BTreeMap<String, String>,
    ) -> Result<(), NodeError> {
        FsUtil::copy_dir_recursive(&pkg.profile_dir(profile_name), &instance_path.join("src"))
            .await
            .map_err(|e| NodeError::External(e.context("failed to copy profile assets")))?;
        tokio::fs::copy(pkg.compose_template_path(profile_name), instance_path.join("docker-compose.yml"))
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to copy compose plan")))?;
        FsUtil::atomic_write(&instance_path.join(".env"), options::format_dotenv(rendered_env).as_bytes())
            .await
            .map_err(|e| NodeError::External(e.context("failed to write instance .env")))
    }

    /// If monitoring is installed, attach the instance's docker network to
    /// each monitoring service container and register each declared
    /// target.
    async fn register_monitoring_targets(&self, plan: &ComposePlan, instance: &Instance, instance_id: &str) -> Result<(), NodeError> {
        if matches!(self.monitoring.status().await?, MonitoringState::NotInstalled) {
            return Ok(());
        }
        let Some(network) = plan.networks.keys().next().cloned() else {
            return Ok(());
        };
        for target in &instance.monitoring.targets {
            let container_name = plan
                .services
                .get(&target.service)
                .and_then(|s| s.container_name.clone())
                .unwrap_or_else(|| target.service.clone());
            if let Some(ip) = self.driver.container_ip(&container_name, &network).await? {
                let endpoint = format!("{ip}:{}", target.port);
                self.monitoring.add_target(&endpoint, &target.path, instance_id, &network).await?;
            }
        }
        Ok(())
    }

    /// Step 9 of install / the re-check on `update`/`restore --run`: poll
    /// the instance's declared API health target until `200`, backing off
    /// exponentially.
    async fn poll_health(&self, plan: &ComposePlan, instance: &Instance) -> Result<(), NodeError> {
        let target = &instance.api_target;
        let container_name = plan
            .services
            .get(&target.service)
            .and_then(|s| s.container_name.clone())
            .unwrap_or_else(|| target.service.clone());
        let network = plan.networks.keys().next().cloned();
        let host = match &network {
            Some(network) => self.driver.container_ip(&container_name, network).await?.unwrap_or_else(|| "localhost".to_string()),
            None => "localhost".to_string(),
        };
        let url = format!("http://{host}:{}{}", target.port, target.path);

        let client = self.health_client.clone();
        let check = || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let response = client.get(&url).send().await?;
                if response.status().as_u16() == 200 {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("health check at {url} returned {}", response.status()))
                }
            }
        };
        check
            .retry(ExponentialBuilder::default())
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("AVS health endpoint never returned 200")))
    }

    /// `update(id, selector, option_values)`: fetch the new version, stage
    /// it alongside a backup copy of the instance's current content, swap
    /// in place, re-run compose `create`, re-check health if it was
    /// running. On any failure after staging, the backup is restored.
    pub async fn update(&self, id: &str, source: UpdateSource, version: VersionSelector, option_values: &BTreeMap<String, String>) -> Result<(), NodeError> {
        tracing::info!(instance_id = %id, "starting update");
        let mut locker = self.data_dir.instance_locker(id);
        locker.lock()?;
        let result = self.update_locked(id, source, version, option_values).await;
        locker.unlock()?;
        match &result {
            Ok(()) => tracing::info!(instance_id = %id, "update complete"),
            Err(e) => tracing::warn!(instance_id = %id, error = ?e, "update failed"),
        }
        result
    }

    async fn update_locked(&self, id: &str, source: UpdateSource, version: VersionSelector, option_values: &BTreeMap<String, String>) -> Result<(), NodeError> {
        let mut stack = CompensationStack::new();
        match self.update_steps(id, &source, &version, option_values, &mut stack).await {
            Ok(()) => {
                stack.commit();
                Ok(())
            }
            Err(e) => {
                stack.unwind().await;
                Err(e)
            }
        }
    }

    async fn update_steps(
        &self,
        id: &str,
        source: &UpdateSource,
        version: &VersionSelector,
        option_values: &BTreeMap<String, String>,
        stack: &mut CompensationStack,
    ) -> Result<(), NodeError> {
        let existing = self.data_dir.instance(id).await?;

        let source_key = match source {
            UpdateSource::Remote { url, .. } => url.clone(),
            UpdateSource::Local(path) => path.display().to_string(),
        };
        let temp_id = Self::scratch_key(&format!("update-{id}-{source_key}"));
        let temp_path = self.data_dir.init_temp(&temp_id).await?;
        self.push_temp_cleanup(stack, &temp_id);

        let auth = match source {
            UpdateSource::Remote { auth, .. } => auth.clone(),
            UpdateSource::Local(_) => None,
        };
        let install_source = match source {
            UpdateSource::Remote { url, .. } => InstallSource::Remote(url.clone()),
            UpdateSource::Local(path) => InstallSource::Local(path.clone()),
        };
        let mut pkg = self.fetch_or_local(&install_source, auth.as_ref(), &temp_path)?;

        if let UpdateSource::Remote { .. } = source {
            let selector = self.resolve_version_selector(&pkg, version)?;
            self.check_update_allowed(&pkg, &existing.version, version)?;
            PackageHandler::checkout(&mut pkg, &selector)?;
        }

        let (_manifest, profiles) = PackageHandler::profiles(&pkg)?;
        let profile = PackageHandler::find_profile(&profiles, &existing.profile)?;

        let instance_path = self.data_dir.instance_path(id);
        let previous_env = Self::read_previous_env(&instance_path).await;
        let mut effective_values = option_values.clone();
        for spec in &profile.options {
            if !effective_values.contains_key(&spec.name)
                && let Some(previous) = previous_env.get(&spec.env_key)
            {
                effective_values.insert(spec.name.clone(), previous.clone());
            }
        }
        let rendered_env = PackageHandler::render_dotenv(&pkg, profile, &effective_values)?;

        let old_compose_path = instance_path.join("docker-compose.yml");
        let was_running = self.instance_was_running(&old_compose_path).await?;

        let backup_id = Self::scratch_key(&format!("backup-{id}"));
        let backup_path = self.data_dir.init_temp(&backup_id).await?;
        FsUtil::copy_dir_recursive(&instance_path, &backup_path)
            .await
            .map_err(|e| NodeError::External(e.context("failed to snapshot instance before update")))?;
        {
            let data_dir = self.data_dir.clone();
            let instance_path = instance_path.clone();
            let backup_path = backup_path.clone();
            let backup_id = backup_id.clone();
            stack.push(Box::pin(async move {
                let _ = FsUtil::copy_dir_recursive(&backup_path, &instance_path).await;
                let _ = data_dir.remove_temp(&backup_id).await;
            }));
        }

        self.stage_instance_files(&pkg, &profile.name, &instance_path, &rendered_env).await?;

        let updated = Instance {
            name: existing.name.clone(),
            url: source_key,
            version: pkg.checked_out.clone().unwrap_or_else(|| "local".to_string()),
            profile: existing.profile.clone(),
            tag: existing.tag.clone(),
            monitoring: InstanceMonitoring {
                targets: profile.monitoring.targets.iter().cloned().map(MonitoringTarget::from).collect(),
            },
            api_target: MonitoringTarget::from(profile.api_target.clone()),
            plugin: existing.plugin.clone(),
            commit: pkg.checked_out.clone().unwrap_or_default(),
        };
        self.data_dir.update_instance(&updated).await?;

        let compose_path = instance_path.join("docker-compose.yml");
        self.driver.create(&compose_path).await?;

        if was_running {
            let plan = ComposePlan::load(&compose_path)?;
            self.driver.up(&compose_path).await?;
            self.poll_health(&plan, &updated).await?;
        }

        // Both scratch dirs are keyed deterministically off the instance id
        // / source, so a second update of the same instance must not find
        // them still present; only the failure path removes them otherwise.
        let _ = self.data_dir.remove_temp(&temp_id).await;
        let _ = self.data_dir.remove_temp(&backup_id).await;

        Ok(())
    }

    /// Refuse only when the requested commit/tag's nearest-ancestor
    /// version tag is strictly older than the installed version; an
    /// unresolvable ancestry (e.g. detached retag) is not grounds for
    /// refusal.
    fn check_update_allowed(&self, pkg: &Package, installed_version: &str, requested: &VersionSelector) -> Result<(), NodeError> {
        let Ok(installed) = Version::parse(installed_version.trim_start_matches('v')) else {
            return Ok(());
        };
        let versions = PackageHandler::versions(pkg)?;
        let requested_version = match requested {
            VersionSelector::Latest => PackageHandler::latest(pkg)?,
            VersionSelector::Tag(tag) => Version::parse(tag.trim_start_matches('v')).ok(),
            VersionSelector::Commit(commit) => {
                let oid = crate::package::git::resolve_selector_oid(&pkg.source, commit)?;
                crate::package::git::nearest_reachable_version(&pkg.source, &versions, oid)?
            }
        };
        if let Some(requested_version) = requested_version
            && crate::package::git::refuses_update(&installed, &requested_version)
        {
            return Err(NodeError::OldVersionRefused {
                current: installed.to_string(),
                requested: requested_version.to_string(),
            });
        }
        Ok(())
    }

    async fn read_previous_env(instance_path: &Path) -> BTreeMap<String, String> {
        match tokio::fs::read_to_string(instance_path.join(".env")).await {
            Ok(contents) => options::parse_dotenv(&contents),
            Err(_) => BTreeMap::new(),
        }
    }

    async fn instance_was_running(&self, compose_path: &Path) -> Result<bool, NodeError> {
        if !compose_path.is_file() {
            return Ok(false);
        }
        let plan = ComposePlan::load(compose_path)?;
        for (key, service) in &plan.services {
            let name = service.container_name.clone().unwrap_or_else(|| key.clone());
            if matches!(
                self.driver.container_status(&name).await?,
                crate::container::ContainerStatus::Running | crate::container::ContainerStatus::Restarting
            ) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// List installed instance ids, for `ls`.
    pub async fn list_instances(&self) -> Result<Vec<String>, NodeError> {
        self.data_dir.list_instances().await
    }

    /// The instance's state machine position as of right now.
    pub async fn state(&self, id: &str) -> Result<InstanceState, NodeError> {
        if !self.data_dir.has_instance(id) {
            return Ok(InstanceState::Absent);
        }
        let compose_path = self.data_dir.instance_path(id).join("docker-compose.yml");
        if !compose_path.is_file() {
            return Ok(InstanceState::Staging);
        }
        let plan = ComposePlan::load(&compose_path)?;
        let mut statuses = Vec::new();
        for (key, service) in &plan.services {
            let name = service.container_name.clone().unwrap_or_else(|| key.clone());
            statuses.push(self.driver.container_status(&name).await?);
        }
        Ok(if statuses.iter().all(|s| {
            matches!(s, crate::container::ContainerStatus::Running | crate::container::ContainerStatus::Restarting)
        }) {
            InstanceState::InstalledRunning
        } else if statuses.iter().all(|s| *s == crate::container::ContainerStatus::Stopped) {
            InstanceState::InstalledStopped
        } else {
            InstanceState::Broken
        })
    }

    /// `run(id)`: compose `up`, idempotent.
    pub async fn run(&self, id: &str) -> Result<(), NodeError> {
        tracing::debug!(instance_id = %id, "run requested");
        let instance_path = self.data_dir.instance(id).await.map(|_| self.data_dir.instance_path(id))?;
        self.driver.up(&instance_path.join("docker-compose.yml")).await?;
        tracing::info!(instance_id = %id, "instance running");
        Ok(())
    }

    /// `stop(id)`: compose `stop`.
    pub async fn stop(&self, id: &str) -> Result<(), NodeError> {
        tracing::debug!(instance_id = %id, "stop requested");
        let instance_path = self.data_dir.instance(id).await.map(|_| self.data_dir.instance_path(id))?;
        self.driver.stop(&instance_path.join("docker-compose.yml")).await?;
        tracing::info!(instance_id = %id, "instance stopped");
        Ok(())
    }

    /// `uninstall(id)`: compose `down`; deregister monitoring targets while
    /// containers are still inspectable; remove the instance dir and any
    /// plugin archive.
    pub async fn uninstall(&self, id: &str) -> Result<(), NodeError> {
        tracing::info!(instance_id = %id, "starting uninstall");
        let instance = self.data_dir.instance(id).await?;
        let instance_path = self.data_dir.instance_path(id);
        let compose_path = instance_path.join("docker-compose.yml");

        if compose_path.is_file()
            && let Ok(plan) = ComposePlan::load(&compose_path)
            && !matches!(self.monitoring.status().await?, MonitoringState::NotInstalled)
            && let Some(network) = plan.networks.keys().next().cloned()
        {
            for target in &instance.monitoring.targets {
                let container_name = plan
                    .services
                    .get(&target.service)
                    .and_then(|s| s.container_name.clone())
                    .unwrap_or_else(|| target.service.clone());
                if let Ok(Some(ip)) = self.driver.container_ip(&container_name, &network).await {
                    let endpoint = format!("{ip}:{}", target.port);
                    let _ = self.monitoring.remove_target(&endpoint, &network).await;
                }
            }
        }

        if compose_path.is_file() {
            self.driver.down(&compose_path).await?;
        }

        if instance.plugin.as_ref().is_some_and(|p| p.kind == PluginKind::LocalArchiveContext) {
            let _ = tokio::fs::remove_file(self.data_dir.plugin_archive_path(id)).await;
        }

        let result = self.data_dir.remove_instance(id).await;
        tracing::info!(instance_id = %id, "uninstall complete");
        result
    }

    /// `backup(id)`: build the snapshotter image on first use; per service
    /// with declared volumes, run the snapshotter with `--volumes-from` and
    /// bind-mounts of a generated config and the growing tar; finally
    /// append `data/…` and `timestamp`.
    pub async fn backup(&self, id: &str) -> Result<BackupId, NodeError> {
        tracing::info!(instance_id = %id, "starting backup");
        let instance = self.data_dir.instance(id).await?;
        let instance_path = self.data_dir.instance_path(id);
        let compose_path = instance_path.join("docker-compose.yml");
        let plan = ComposePlan::load(&compose_path)?;

        self.ensure_snapshotter_image().await?;

        let timestamp = chrono::Utc::now().timestamp() as u64;
        let backup_id = BackupId::new(instance.instance_id(), timestamp);
        let tar_path = self.data_dir.init_backup(&backup_id).await?;
        init_empty_tar(&tar_path)?;

        let config_temp_id = Self::scratch_key(&format!("backup-config-{id}-{timestamp}"));
        let config_dir = self.data_dir.init_temp(&config_temp_id).await?;

        for (key, service) in &plan.services {
            if service.volumes.is_empty() {
                continue;
            }
            let container_name = service.container_name.clone().unwrap_or_else(|| key.clone());
            let paths: Vec<String> = service.volumes.iter().filter_map(|v| v.split(':').nth(1).map(str::to_string)).collect();
            let config_path = config_dir.join(format!("{key}.yml"));
            let config_yaml = serde_yaml::to_string(&SnapshotConfig { prefix: format!("volumes/{key}"), paths })
                .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to render snapshot config")))?;
            tokio::fs::write(&config_path, config_yaml)
                .await
                .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to write snapshot config")))?;

            self.driver
                .run(
                    SNAPSHOTTER_IMAGE,
                    RunOptions {
                        args: vec!["backup".to_string()],
                        volumes_from: vec![container_name],
                        mounts: vec![
                            (config_path.display().to_string(), "/config.yml".to_string()),
                            (tar_path.display().to_string(), "/backup.tar".to_string()),
                        ],
                        auto_remove: true,
                        ..Default::default()
                    },
                )
                .await?;
        }

        append_dir_and_timestamp_to_tar(&tar_path, &instance_path, timestamp)?;
        let _ = self.data_dir.remove_temp(&config_temp_id).await;

        tracing::info!(instance_id = %id, backup_id = %backup_id, "backup complete");
        Ok(backup_id)
    }

    async fn ensure_snapshotter_image(&self) -> Result<(), NodeError> {
        if self.driver.image_exists(SNAPSHOTTER_IMAGE).await? {
            return Ok(());
        }
        let build_temp_id = Self::scratch_key("snapshotter-build");
        let build_dir = self.data_dir.init_temp(&build_temp_id).await?;
        git2::build::RepoBuilder::new()
            .clone(SNAPSHOTTER_BUILD_CONTEXT, &build_dir)
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to clone snapshotter build context")))?;
        self.driver.build_from_uri(&build_dir, SNAPSHOTTER_IMAGE).await?;
        self.data_dir.remove_temp(&build_temp_id).await
    }

    /// `restore([--run], backup_id)`: validate the tar's `timestamp` entry,
    /// extract `data/` over the instance directory, compose `create`, then
    /// rehydrate every declared volume via the snapshotter in restore mode.
    pub async fn restore(&self, backup_id: &BackupId, run_after: bool) -> Result<(), NodeError> {
        tracing::info!(backup_id = %backup_id, "starting restore");
        let tar_path = self.data_dir.backup(backup_id)?;
        validate_backup_tar(&tar_path, backup_id.timestamp)?;

        self.data_dir.replace_instance_dir_from_tar(&backup_id.instance_id, &tar_path, "data")?;
        let instance = self.data_dir.instance(&backup_id.instance_id).await?;
        let instance_path = self.data_dir.instance_path(&backup_id.instance_id);
        let compose_path = instance_path.join("docker-compose.yml");
        let plan = ComposePlan::load(&compose_path)?;

        self.driver.create(&compose_path).await?;

        for (key, service) in &plan.services {
            if service.volumes.is_empty() {
                continue;
            }
            let container_name = service.container_name.clone().unwrap_or_else(|| key.clone());
            let paths: Vec<String> = service.volumes.iter().filter_map(|v| v.split(':').nth(1).map(str::to_string)).collect();
            let config_temp_id = Self::scratch_key(&format!("restore-config-{key}-{}", backup_id.format()));
            let config_dir = self.data_dir.init_temp(&config_temp_id).await?;
            let config_path = config_dir.join(format!("{key}.yml"));
            let config_yaml = serde_yaml::to_string(&SnapshotConfig { prefix: format!("volumes/{key}"), paths })
                .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to render snapshot config")))?;
            tokio::fs::write(&config_path, config_yaml)
                .await
                .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to write snapshot config")))?;

            self.driver
                .run(
                    SNAPSHOTTER_IMAGE,
                    RunOptions {
                        args: vec!["restore".to_string()],
                        volumes_from: vec![container_name],
                        mounts: vec![
                            (config_path.display().to_string(), "/config.yml".to_string()),
                            (tar_path.display().to_string(), "/backup.tar".to_string()),
                        ],
                        auto_remove: true,
                        ..Default::default()
                    },
                )
                .await?;
            let _ = self.data_dir.remove_temp(&config_temp_id).await;
        }

        if run_after {
            self.driver.up(&compose_path).await?;
            self.poll_health(&plan, &instance).await?;
        }

        tracing::info!(backup_id = %backup_id, "restore complete");
        Ok(())
    }

    /// `plugin(id, plugin_args, mounts, host)`: resolve the plugin spec,
    /// build/pull its image on first use, run it ephemerally joined to the
    /// instance's network (or the host network). Returns the exit code.
    pub async fn plugin_run(&self, id: &str, plugin_args: Vec<String>, mounts: Vec<(String, String)>, host_network: bool) -> Result<i64, NodeError> {
        tracing::debug!(instance_id = %id, "starting plugin run");
        let instance = self.data_dir.instance(id).await?;
        let plugin = instance.plugin.clone().ok_or_else(|| NodeError::InvalidConf {
            problems: vec![format!("instance '{id}' has no plugin configured")],
        })?;

        let tag = format!("{id}:latest");
        match plugin.kind {
            PluginKind::PreBuiltImage => {}
            PluginKind::RemoteGitContext => {
                if !self.driver.image_exists(&tag).await? {
                    self.build_plugin_from_remote(&plugin.src, &tag).await?;
                }
            }
            PluginKind::LocalArchiveContext => {
                if !self.driver.image_exists(&tag).await? {
                    self.build_plugin_from_archive(id, &tag).await?;
                }
            }
        }
        let image = if plugin.kind == PluginKind::PreBuiltImage { plugin.src.clone() } else { tag };

        let instance_path = self.data_dir.instance_path(id);
        let compose_path = instance_path.join("docker-compose.yml");
        let network = if host_network {
            None
        } else if compose_path.is_file() {
            ComposePlan::load(&compose_path)?.networks.keys().next().cloned()
        } else {
            None
        };

        let result = self
            .driver
            .run(
                &image,
                RunOptions {
                    args: plugin_args,
                    mounts,
                    network,
                    host_network,
                    auto_remove: true,
                    container_name: Some(format!("eigen-plugin-{id}")),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(instance_id = %id, exit_code = result.exit_code, "plugin run complete");
        Ok(result.exit_code)
    }

    async fn build_plugin_from_remote(&self, src: &str, tag: &str) -> Result<(), NodeError> {
        // src is `url#ref:subdir` (PluginSpec::RemoteGitContext); split on
        // '#' first since the url itself contains '://'.
        let (url, ref_and_subdir) = src.split_once('#').unwrap_or((src, "main"));
        let (git_ref, subdir) = ref_and_subdir.split_once(':').unwrap_or((ref_and_subdir, ""));

        let temp_id = Self::scratch_key(&format!("plugin-build-{src}"));
        let temp_path = self.data_dir.init_temp(&temp_id).await?;
        let repo = git2::build::RepoBuilder::new()
            .clone(url, &temp_path)
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to clone plugin build context")))?;
        if let Ok(reference) = repo.find_reference(&format!("refs/heads/{git_ref}"))
            && let Ok(commit) = reference.peel_to_commit()
        {
            let mut checkout_builder = git2::build::CheckoutBuilder::new();
            checkout_builder.force();
            let _ = repo.checkout_tree(commit.as_object(), Some(&mut checkout_builder));
        }
        let context_dir = if subdir.is_empty() { temp_path.clone() } else { temp_path.join(subdir) };
        self.driver.build_from_uri(&context_dir, tag).await?;
        self.data_dir.remove_temp(&temp_id).await
    }

    async fn build_plugin_from_archive(&self, instance_id: &str, tag: &str) -> Result<(), NodeError> {
        let archive_path = self.data_dir.plugin_archive_path(instance_id);
        let temp_id = Self::scratch_key(&format!("plugin-extract-{instance_id}"));
        let temp_path = self.data_dir.init_temp(&temp_id).await?;

        let file = std::fs::File::open(&archive_path)
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to open plugin archive")))?;
        let mut archive = tar::Archive::new(file);
        archive
            .unpack(&temp_path)
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to extract plugin archive")))?;

        self.driver.build_from_uri(&temp_path, tag).await?;
        self.data_dir.remove_temp(&temp_id).await
    }
}

#[derive(serde::Serialize)]
struct SnapshotConfig {
    prefix: String,
    paths: Vec<String>,
}

fn tar_dir_to_file(src: &Path, dest: &Path) -> Result<(), NodeError> {
    let file = std::fs::File::create(dest).map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to create plugin archive")))?;
    let mut builder = tar::Builder::new(file);
    builder
        .append_dir_all(".", src)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to tar plugin context")))?;
    builder
        .finish()
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to finish plugin archive")))
}

fn init_empty_tar(path: &Path) -> Result<(), NodeError> {
    let file = std::fs::File::create(path).map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to create backup tar")))?;
    tar::Builder::new(file)
        .finish()
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to initialize backup tar")))
}

/// Re-open a tar file, drop its two trailing zero-block end-of-archive
/// markers, and append `data/…` plus a `timestamp` entry — the entries the
/// engine owns directly rather than delegating to the snapshotter.
fn append_dir_and_timestamp_to_tar(tar_path: &Path, instance_path: &Path, timestamp: u64) -> Result<(), NodeError> {
    let len = std::fs::metadata(tar_path)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to stat backup tar")))?
        .len();
    let truncate_at = len.saturating_sub(1024);
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(tar_path)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to reopen backup tar")))?;
    file.set_len(truncate_at)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to truncate backup tar end marker")))?;
    use std::io::Seek;
    let mut file = file;
    file.seek(std::io::SeekFrom::Start(truncate_at))
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to seek backup tar")))?;

    let mut builder = tar::Builder::new(file);
    builder
        .append_dir_all("data", instance_path)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to append instance data to backup tar")))?;

    let contents = timestamp.to_string();
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "timestamp", contents.as_bytes())
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to append timestamp to backup tar")))?;

    builder
        .finish()
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to finish backup tar")))
}

fn validate_backup_tar(tar_path: &Path, expected_timestamp: u64) -> Result<(), NodeError> {
    let file = std::fs::File::open(tar_path).map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to open backup tar")))?;
    let mut archive = tar::Archive::new(file);
    let entries = archive
        .entries()
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read backup tar entries")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read backup tar entry")))?;
        let path = entry
            .path()
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read backup tar entry path")))?
            .to_path_buf();
        if path == Path::new("timestamp") {
            let mut contents = String::new();
            std::io::Read::read_to_string(&mut entry, &mut contents)
                .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read timestamp entry")))?;
            let parsed: u64 = contents
                .trim()
                .parse()
                .map_err(|_| NodeError::InvalidBackupName { name: "timestamp entry is not a valid integer".to_string() })?;
            if parsed != expected_timestamp {
                return Err(NodeError::InvalidBackupName {
                    name: format!("timestamp entry {parsed} does not match filename timestamp {expected_timestamp}"),
                });
            }
            return Ok(());
        }
    }
    Err(NodeError::InvalidBackupName { name: "backup tar has no timestamp entry".to_string() })
}
