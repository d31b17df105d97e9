//! Instance data directory & locker: the on-disk state store.

pub mod locker;

use std::path::{Path, PathBuf};

use tar::Archive;

use crate::error::NodeError;
use crate::fs_util::FsUtil;
use crate::model::{BackupId, Instance};
use locker::Locker;

/// Root-resolved namespace of on-disk state: `nodes/`, `backups/`,
/// `temp/`, `monitoring/`, `plugin/`.
#[derive(Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the default root: `$XDG_DATA_HOME/.eigen`, falling back to
    /// `$HOME/.local/share/.eigen`.
    pub fn default_root() -> Result<PathBuf, NodeError> {
        let base = dirs::data_dir().ok_or_else(|| {
            NodeError::External(anyhow::anyhow!("could not resolve a data directory for this platform"))
        })?;
        Ok(base.join(".eigen"))
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn nodes_dir(&self) -> PathBuf {
        self.root.join("nodes")
    }

    fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn instance_path(&self, id: &str) -> PathBuf {
        self.nodes_dir().join(id)
    }

    pub fn temp_path(&self, id: &str) -> PathBuf {
        self.temp_dir().join(id)
    }

    pub fn backup_path(&self, id: &BackupId) -> PathBuf {
        self.backups_dir().join(format!("{}.tar", id.format()))
    }

    pub fn plugin_archive_path(&self, instance_id: &str) -> PathBuf {
        self.root.join("plugin").join(format!("{instance_id}.tar"))
    }

    pub fn has_instance(&self, id: &str) -> bool {
        self.instance_path(id).is_dir()
    }

    /// `ls`: every instance directory name under `nodes/`, in no particular order.
    pub async fn list_instances(&self) -> Result<Vec<String>, NodeError> {
        let dir = self.nodes_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read nodes directory")))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read node entry")))?
        {
            if entry.file_type().await.is_ok_and(|t| t.is_dir())
                && let Some(name) = entry.file_name().to_str()
            {
                ids.push(name.to_string());
            }
        }
        Ok(ids)
    }

    /// `init_instance(instance)`: exclusive create; validates fields,
    /// writes `.lock` and `state.json`; removes the directory on any failure
    /// so a failed init never leaves a partial `nodes/<id>`.
    pub async fn init_instance(&self, instance: &Instance) -> Result<(), NodeError> {
        let id = instance.instance_id();
        let path = self.instance_path(&id);

        if path.exists() {
            return Err(NodeError::InstanceAlreadyExists { id });
        }
        instance
            .validate()
            .map_err(|problems| NodeError::InvalidConf { problems })?;

        let result = self.init_instance_inner(&path, instance).await;
        if result.is_err() {
            let _ = FsUtil::remove_dir_if_exists(&path).await;
        }
        result
    }

    async fn init_instance_inner(&self, path: &Path, instance: &Instance) -> Result<(), NodeError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to create instance directory")))?;
        tokio::fs::write(path.join(".lock"), b"")
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to create lock file")))?;
        FsUtil::atomic_write_json(&path.join("state.json"), instance)
            .await
            .map_err(|e| NodeError::External(e.context("failed to write state.json")))?;
        Ok(())
    }

    /// Overwrite `state.json` for an already-installed instance (used by
    /// `update`, after its new content has been staged in place). Unlike
    /// `init_instance`, a failure here does not remove the directory — the
    /// caller is mid-swap and owns its own compensation.
    pub async fn update_instance(&self, instance: &Instance) -> Result<(), NodeError> {
        let id = instance.instance_id();
        let path = self.instance_path(&id);
        if !path.is_dir() {
            return Err(NodeError::InstanceNotFound { id });
        }
        instance
            .validate()
            .map_err(|problems| NodeError::InvalidConf { problems })?;
        FsUtil::atomic_write_json(&path.join("state.json"), instance)
            .await
            .map_err(|e| NodeError::External(e.context("failed to write state.json")))
    }

    /// Read and validate `state.json` for `id`.
    pub async fn instance(&self, id: &str) -> Result<Instance, NodeError> {
        let path = self.instance_path(id);
        if !path.exists() {
            return Err(NodeError::InstanceNotFound { id: id.to_string() });
        }
        if !path.join(".lock").is_file() || !path.join("state.json").is_file() {
            return Err(NodeError::InvalidInstanceDir { id: id.to_string() });
        }

        let contents = tokio::fs::read_to_string(path.join("state.json"))
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read state.json")))?;
        let instance: Instance = serde_json::from_str(&contents).map_err(|_| NodeError::InvalidInstance {
            reason: format!("state.json for '{id}' failed schema validation"),
        })?;
        instance.validate().map_err(|problems| NodeError::InvalidInstance {
            reason: problems.join("; "),
        })?;
        Ok(instance)
    }

    /// `remove_instance(id)`: requires a directory (not a bare file); removes recursively.
    pub async fn remove_instance(&self, id: &str) -> Result<(), NodeError> {
        let path = self.instance_path(id);
        if path.exists() && !path.is_dir() {
            return Err(NodeError::InvalidInstanceDir { id: id.to_string() });
        }
        FsUtil::remove_dir_if_exists(&path)
            .await
            .map_err(|e| NodeError::External(e.context("failed to remove instance directory")))
    }

    /// `init_temp(id)`: exclusive scratch area for in-progress installs.
    pub async fn init_temp(&self, id: &str) -> Result<PathBuf, NodeError> {
        let path = self.temp_path(id);
        if path.exists() {
            return Err(NodeError::TempDirAlreadyExists { id: id.to_string() });
        }
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to create temp directory")))?;
        Ok(path)
    }

    pub async fn remove_temp(&self, id: &str) -> Result<(), NodeError> {
        FsUtil::remove_dir_if_exists(&self.temp_path(id))
            .await
            .map_err(|e| NodeError::External(e.context("failed to remove temp directory")))
    }

    /// `init_backup(backup)`: stage an empty tar file at the backup's path,
    /// failing if one already exists for that id.
    pub async fn init_backup(&self, id: &BackupId) -> Result<PathBuf, NodeError> {
        let path = self.backup_path(id);
        tokio::fs::create_dir_all(self.backups_dir())
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to create backups directory")))?;
        if path.exists() {
            return Err(NodeError::InvalidBackupName { name: id.format() });
        }
        Ok(path)
    }

    /// `backup_list()`: every well-formed backup id found under `backups/`.
    pub async fn backup_list(&self) -> Result<Vec<BackupId>, NodeError> {
        let dir = self.backups_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read backups directory")))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read backup entry")))?
        {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".tar")) else {
                continue;
            };
            if let Some(id) = BackupId::parse(stem) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// `backup(id)`: locate a single backup by id.
    pub fn backup(&self, id: &BackupId) -> Result<PathBuf, NodeError> {
        let path = self.backup_path(id);
        if !path.is_file() {
            return Err(NodeError::InvalidBackupName { name: id.format() });
        }
        Ok(path)
    }

    /// `monitoring_stack()`: lazily create `monitoring/` and its lock.
    pub async fn monitoring_stack(&self) -> Result<(PathBuf, Locker), NodeError> {
        let path = self.root.join("monitoring");
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to create monitoring directory")))?;
        let lock_path = path.join(".lock");
        if !lock_path.exists() {
            tokio::fs::write(&lock_path, b"")
                .await
                .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to create monitoring lock")))?;
        }
        Ok((path, Locker::new(lock_path)))
    }

    pub fn instance_locker(&self, id: &str) -> Locker {
        Locker::new(self.instance_path(id).join(".lock"))
    }

    /// `replace_instance_dir_from_tar(id, tar, subpath)`: extract
    /// `subpath/*` from `tar` into `nodes/<id>/`, overwriting.
    pub fn replace_instance_dir_from_tar(&self, id: &str, tar_path: &Path, subpath: &str) -> Result<(), NodeError> {
        let dest = self.instance_path(id);
        std::fs::create_dir_all(&dest)
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to create instance directory")))?;

        let file = std::fs::File::open(tar_path)
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to open backup tar")))?;
        let mut archive = Archive::new(file);
        let prefix = format!("{}/", subpath.trim_end_matches('/'));

        let entries = archive
            .entries()
            .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read tar entries")))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read tar entry")))?;
            let path = entry
                .path()
                .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read entry path")))?
                .to_path_buf();
            let Ok(rel) = path.strip_prefix(&prefix) else {
                continue;
            };
            if rel.as_os_str().is_empty() {
                continue;
            }
            let target = dest.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            entry
                .unpack(&target)
                .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to unpack tar entry")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceMonitoring, MonitoringTarget};
    use tempdir::TempDir;

    fn instance(name: &str, tag: &str) -> Instance {
        Instance {
            name: name.to_string(),
            url: "https://example.com/mock-avs".into(),
            version: "v1.0.0".into(),
            profile: "default".into(),
            tag: tag.to_string(),
            monitoring: InstanceMonitoring::default(),
            api_target: MonitoringTarget { service: "svc".into(), port: 8080, path: "/health".into() },
            plugin: None,
            commit: "a".repeat(40),
        }
    }

    #[tokio::test]
    async fn init_instance_then_read_round_trips() {
        let dir = TempDir::new("datadir").unwrap();
        let data_dir = DataDir::new(dir.path());
        let inst = instance("mock-avs", "default");
        data_dir.init_instance(&inst).await.unwrap();
        assert!(data_dir.has_instance("mock-avs-default"));
        let read = data_dir.instance("mock-avs-default").await.unwrap();
        assert_eq!(read, inst);
    }

    #[tokio::test]
    async fn init_instance_twice_fails_already_exists() {
        let dir = TempDir::new("datadir").unwrap();
        let data_dir = DataDir::new(dir.path());
        let inst = instance("mock-avs", "default");
        data_dir.init_instance(&inst).await.unwrap();
        let err = data_dir.init_instance(&inst).await.unwrap_err();
        assert!(matches!(err, NodeError::InstanceAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn init_instance_removes_dir_on_validation_failure() {
        let dir = TempDir::new("datadir").unwrap();
        let data_dir = DataDir::new(dir.path());
        let mut inst = instance("mock-avs", "default");
        inst.name = String::new();
        let err = data_dir.init_instance(&inst).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidConf { .. }));
        assert!(!data_dir.instance_path("mock-avs-default").exists());
        assert!(!data_dir.instance_path("-default").exists());
    }

    #[tokio::test]
    async fn instance_not_found_for_missing_dir() {
        let dir = TempDir::new("datadir").unwrap();
        let data_dir = DataDir::new(dir.path());
        let err = data_dir.instance("nonexistent-default").await.unwrap_err();
        assert!(matches!(err, NodeError::InstanceNotFound { .. }));
    }

    #[tokio::test]
    async fn init_temp_is_exclusive() {
        let dir = TempDir::new("datadir").unwrap();
        let data_dir = DataDir::new(dir.path());
        data_dir.init_temp("abc").await.unwrap();
        let err = data_dir.init_temp("abc").await.unwrap_err();
        assert!(matches!(err, NodeError::TempDirAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn backup_list_round_trips_ids() {
        let dir = TempDir::new("datadir").unwrap();
        let data_dir = DataDir::new(dir.path());
        let id = BackupId::new("mock-avs-default", 1_700_000_000);
        let path = data_dir.init_backup(&id).await.unwrap();
        tokio::fs::write(&path, b"fake-tar").await.unwrap();

        let listed = data_dir.backup_list().await.unwrap();
        assert_eq!(listed, vec![id]);
    }
}
