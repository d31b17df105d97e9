//! SHA-256 checksum file compute/verify for a package's `pkg/` subtree.
//!
//! Format: lines `<64-hex-sha256>  <relative-path>\n`.

use std::collections::BTreeMap;
use std::io::Read as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::error::NodeError;

/// Compute the SHA-256 hash of a single file, hex-encoded.
///
/// Streams the file in 8KiB chunks rather than reading it whole, so large
/// package archives don't need to fit in memory at once.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Walk `pkg_root` and hash every regular file under it, keyed by the
/// path relative to `pkg_root` (forward-slash separated, stable order).
pub fn hash_tree(pkg_root: &Path) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![pkg_root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read directory {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path
                    .strip_prefix(pkg_root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                out.insert(rel, hash_file(&path)?);
            }
        }
    }
    Ok(out)
}

/// Parse a checksum file's contents into `relative_path -> sha256`.
pub fn parse_checksum_file(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(2, "  ");
            let hash = parts.next()?.trim();
            let path = parts.next()?.trim();
            if hash.len() == 64 && !path.is_empty() {
                Some((path.to_string(), hash.to_lowercase()))
            } else {
                None
            }
        })
        .collect()
}

/// Render a checksum map back into the on-disk line format.
pub fn format_checksum_file(hashes: &BTreeMap<String, String>) -> String {
    hashes
        .iter()
        .map(|(path, hash)| format!("{}  {}\n", hash, path))
        .collect()
}

/// Verify `pkg_root` against an optional checksum file. Absence of a
/// checksum file is not an error. On any count or value mismatch, fails
/// with `InvalidChecksum`.
pub fn verify(pkg_root: &Path, checksum_file: Option<&PathBuf>) -> Result<(), NodeError> {
    if !pkg_root.is_dir() {
        return Err(NodeError::DirNotFound {
            path: pkg_root.display().to_string(),
        });
    }

    let Some(checksum_path) = checksum_file else {
        return Ok(());
    };
    if !checksum_path.is_file() {
        return Ok(());
    }

    let contents = std::fs::read_to_string(checksum_path)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to read checksum file")))?;
    let expected = parse_checksum_file(&contents);
    let actual = hash_tree(pkg_root)
        .map_err(|e| NodeError::External(e.context("failed to hash package tree")))?;

    if expected.len() != actual.len() || expected != actual {
        return Err(NodeError::InvalidChecksum {
            path: checksum_path.display().to_string(),
        });
    }

    Ok(())
}
