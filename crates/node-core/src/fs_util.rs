//! File system helpers: recursive copy and atomic write-temp + rename.

use std::path::Path;

use anyhow::{Context, Result};

pub struct FsUtil;

impl FsUtil {
    /// Recursively copy a directory tree from `src` to `dst`, creating `dst`
    /// and all intermediate directories.
    pub async fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dst).await.with_context(|| {
            format!("failed to create destination directory: {}", dst.display())
        })?;

        let mut entries = tokio::fs::read_dir(src)
            .await
            .with_context(|| format!("failed to read source directory: {}", src.display()))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .context("failed to read directory entry")?
        {
            let src_path = entry.path();
            let dst_path = dst.join(entry.file_name());
            let file_type = entry.file_type().await.context("failed to get file type")?;

            if file_type.is_dir() {
                Box::pin(Self::copy_dir_recursive(&src_path, &dst_path)).await?;
            } else {
                tokio::fs::copy(&src_path, &dst_path).await.with_context(|| {
                    format!("failed to copy {} -> {}", src_path.display(), dst_path.display())
                })?;
            }
        }

        Ok(())
    }

    /// Write `contents` to `path` atomically: write to a `.tmp` sibling on
    /// the same filesystem, fsync, then rename over the destination. Used
    /// for every mutation of `state.json`, `.env`, and `prometheus.yml`.
    pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .with_context(|| format!("path has no parent: {}", path.display()))?;
        tokio::fs::create_dir_all(parent).await.ok();

        let tmp_path = parent.join(format!(
            ".{}.tmp",
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("write")
        ));

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
        use tokio::io::AsyncWriteExt;
        file.write_all(contents)
            .await
            .with_context(|| format!("failed to write temp file: {}", tmp_path.display()))?;
        file.sync_all().await.ok();
        drop(file);

        tokio::fs::rename(&tmp_path, path).await.with_context(|| {
            format!("failed to rename {} -> {}", tmp_path.display(), path.display())
        })?;

        Ok(())
    }

    /// Serialize `value` as pretty JSON and write it atomically.
    pub async fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_vec_pretty(value).context("failed to serialize to JSON")?;
        Self::atomic_write(path, &content).await
    }

    /// Remove a directory tree if present; a no-op if it doesn't exist.
    pub async fn remove_dir_if_exists(path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[tokio::test]
    async fn atomic_write_creates_file_with_content() {
        let dir = TempDir::new("fs_util").unwrap();
        let path = dir.path().join("state.json");
        FsUtil::atomic_write(&path, b"{\"a\":1}").await.unwrap();
        let read = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(read, "{\"a\":1}");
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_tmp_file_behind() {
        let dir = TempDir::new("fs_util").unwrap();
        let path = dir.path().join("state.json");
        FsUtil::atomic_write(&path, b"{}").await.unwrap();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["state.json".to_string()]);
    }

    #[tokio::test]
    async fn copy_dir_recursive_preserves_structure() {
        let src = TempDir::new("fs_util_src").unwrap();
        let dst = TempDir::new("fs_util_dst").unwrap();
        tokio::fs::create_dir_all(src.path().join("nested")).await.unwrap();
        tokio::fs::write(src.path().join("a.txt"), b"a").await.unwrap();
        tokio::fs::write(src.path().join("nested/b.txt"), b"b").await.unwrap();

        FsUtil::copy_dir_recursive(src.path(), dst.path()).await.unwrap();

        assert_eq!(tokio::fs::read_to_string(dst.path().join("a.txt")).await.unwrap(), "a");
        assert_eq!(
            tokio::fs::read_to_string(dst.path().join("nested/b.txt")).await.unwrap(),
            "b"
        );
    }
}
