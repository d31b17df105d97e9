//! Git-backed package source control: `fetch`/`versions`/`checkout` over a
//! real clone via `git2`, not a shelled-out CLI.

use std::path::{Path, PathBuf};

use semver::Version;

use crate::error::NodeError;

const VERSION_TAG_PATTERN: &str = r"^v(\d+)\.(\d+)\.(\d+)$";

/// Optional credentials for a private remote.
#[derive(Debug, Clone, Default)]
pub struct GitAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
}

/// A fetched package source: a clone of the remote at `repo_path`.
pub struct PackageSource {
    pub repo_path: PathBuf,
}

fn build_callbacks(auth: Option<&GitAuth>) -> git2::RemoteCallbacks<'static> {
    let mut callbacks = git2::RemoteCallbacks::new();
    let auth = auth.cloned();
    callbacks.credentials(move |_url, username_from_url, allowed| {
        if let Some(auth) = &auth {
            if allowed.contains(git2::CredentialType::SSH_KEY)
                && let Some(key_path) = &auth.ssh_key_path
            {
                return git2::Cred::ssh_key(
                    username_from_url.unwrap_or("git"),
                    None,
                    key_path,
                    None,
                );
            }
            if allowed.contains(git2::CredentialType::USER_PASS_PLAINTEXT)
                && let (Some(username), Some(password)) = (&auth.username, &auth.password)
            {
                return git2::Cred::userpass_plaintext(username, password);
            }
        }
        git2::Cred::default()
    });
    callbacks
}

/// `fetch(url, auth?) -> pkg`: clone the repository into `scratch_dir`.
///
/// Captures the remote's tag set at this single point in time; later
/// `versions`/`checkout` calls operate over this clone and never re-query
/// the remote.
pub fn fetch(url: &str, auth: Option<&GitAuth>, scratch_dir: &Path) -> Result<PackageSource, NodeError> {
    if url.trim().is_empty() || url::Url::parse(url).is_err() {
        // Allow scp-style git remotes (git@host:path) which aren't valid URLs.
        if !url.contains('@') && !url.starts_with("git://") {
            return Err(NodeError::InvalidUrl(url.to_string()));
        }
    }

    let mut fetch_options = git2::FetchOptions::new();
    fetch_options.remote_callbacks(build_callbacks(auth));

    let mut builder = git2::build::RepoBuilder::new();
    builder.fetch_options(fetch_options);

    builder.clone(url, scratch_dir).map_err(|e| match e.code() {
        git2::ErrorCode::Auth => NodeError::RepoPrivateOrMissing { url: url.to_string() },
        git2::ErrorCode::NotFound => NodeError::RepoNotFound { url: url.to_string() },
        _ if e.class() == git2::ErrorClass::Net => NodeError::RepoNotFound { url: url.to_string() },
        _ => NodeError::External(anyhow::anyhow!(e).context(format!("failed to clone {url}"))),
    })?;

    Ok(PackageSource {
        repo_path: scratch_dir.to_path_buf(),
    })
}

fn version_tag_regex_match(tag: &str) -> Option<Version> {
    // Matches ^v\d+\.\d+\.\d+$ without pulling in a regex dependency: a
    // small hand check is clearer here than building a regex for one
    // fixed shape used nowhere else in this module.
    let rest = tag.strip_prefix('v')?;
    let parts: Vec<&str> = rest.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    Version::parse(rest).ok()
}

/// `versions(pkg) -> [version]`: tags matching `^v\d+\.\d+\.\d+$`, sorted
/// strictly descending by semver. Fails `NoVersions` if empty.
pub fn versions(source: &PackageSource) -> Result<Vec<Version>, NodeError> {
    let repo = git2::Repository::open(&source.repo_path)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to open repository")))?;

    let tag_names = repo
        .tag_names(None)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to list tags")))?;

    let mut versions: Vec<Version> = tag_names
        .iter()
        .flatten()
        .filter_map(version_tag_regex_match)
        .collect();

    versions.sort_by(|a, b| b.cmp(a));

    if versions.is_empty() {
        return Err(NodeError::NoVersions);
    }

    Ok(versions)
}

pub fn has_version(versions: &[Version], v: &Version) -> bool {
    versions.contains(v)
}

pub fn latest(versions: &[Version]) -> Option<Version> {
    versions.first().cloned()
}

/// Resolve the version currently checked out, by matching HEAD's commit
/// against the commit each version tag points to.
pub fn current(source: &PackageSource, versions: &[Version]) -> Result<Option<Version>, NodeError> {
    let repo = git2::Repository::open(&source.repo_path)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to open repository")))?;
    let head = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to resolve HEAD")))?;

    for version in versions {
        let tag_name = format!("v{version}");
        if let Ok(reference) = repo.find_reference(&format!("refs/tags/{tag_name}"))
            && let Ok(commit) = reference.peel_to_commit()
            && commit.id() == head.id()
        {
            return Ok(Some(version.clone()));
        }
    }
    Ok(None)
}

fn is_commit_hash(selector: &str) -> bool {
    selector.len() == 40 && selector.chars().all(|c| c.is_ascii_hexdigit())
}

/// Resolve a version tag (`v1.2.3`) or a 40-hex commit hash to the commit
/// it names, without touching the working tree. Shared by `checkout` and
/// `resolve_selector_oid` so both judge the selector the same way.
fn resolve_oid(repo: &git2::Repository, selector: &str) -> Result<git2::Oid, NodeError> {
    if is_commit_hash(selector) {
        let oid = git2::Oid::from_str(selector).map_err(|_| NodeError::InvalidVersion(selector.to_string()))?;
        let commit = repo.find_commit(oid).map_err(|_| NodeError::InvalidVersion(selector.to_string()))?;
        Ok(commit.id())
    } else {
        let tag_ref = format!("refs/tags/{selector}");
        let reference = repo
            .find_reference(&tag_ref)
            .map_err(|_| NodeError::InvalidVersion(selector.to_string()))?;
        let commit = reference
            .peel_to_commit()
            .map_err(|_| NodeError::InvalidVersion(selector.to_string()))?;
        Ok(commit.id())
    }
}

/// Resolve `update --commit H` (or a tag) to the commit it names, ahead of
/// `checkout` ever moving HEAD there — lets `nearest_reachable_version` walk
/// from the selector itself instead of wherever HEAD currently sits.
pub fn resolve_selector_oid(source: &PackageSource, selector: &str) -> Result<git2::Oid, NodeError> {
    let repo = git2::Repository::open(&source.repo_path)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to open repository")))?;
    resolve_oid(&repo, selector)
}

/// Walk `start`'s ancestry for the nearest commit that a version tag points
/// to: `update --commit H` is judged against H's *nearest-ancestor* version
/// tag, not an exact match like `current`, and not against HEAD — the
/// caller resolves `start` from the requested selector via
/// [`resolve_selector_oid`].
pub fn nearest_reachable_version(source: &PackageSource, versions: &[Version], start: git2::Oid) -> Result<Option<Version>, NodeError> {
    let repo = git2::Repository::open(&source.repo_path)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to open repository")))?;

    let mut tag_commits: std::collections::HashMap<git2::Oid, Version> = std::collections::HashMap::new();
    for version in versions {
        let tag_name = format!("v{version}");
        if let Ok(reference) = repo.find_reference(&format!("refs/tags/{tag_name}"))
            && let Ok(commit) = reference.peel_to_commit()
        {
            tag_commits.insert(commit.id(), version.clone());
        }
    }

    let mut revwalk = repo
        .revwalk()
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to start revwalk")))?;
    revwalk
        .push(start)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to seed revwalk")))?;

    for oid in revwalk {
        let oid = oid.map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to walk commit history")))?;
        if let Some(version) = tag_commits.get(&oid) {
            return Ok(Some(version.clone()));
        }
    }
    Ok(None)
}

/// `checkout(pkg, selector)`: accepts a version tag (`v1.2.3`) or a 40-hex
/// commit hash; force-moves the working tree. Returns the resolved commit
/// hash. Fails `InvalidVersion` for anything else (unknown tag, malformed
/// selector, non-existent commit).
pub fn checkout(source: &PackageSource, selector: &str) -> Result<String, NodeError> {
    let repo = git2::Repository::open(&source.repo_path)
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to open repository")))?;

    let oid = resolve_oid(&repo, selector)?;
    let commit = repo
        .find_commit(oid)
        .map_err(|_| NodeError::InvalidVersion(selector.to_string()))?;

    let tree = commit
        .tree()
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to resolve commit tree")))?;

    let mut checkout_builder = git2::build::CheckoutBuilder::new();
    checkout_builder.force();
    repo.checkout_tree(tree.as_object(), Some(&mut checkout_builder))
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to checkout tree")))?;
    repo.set_head_detached(commit.id())
        .map_err(|e| NodeError::External(anyhow::anyhow!(e).context("failed to detach HEAD")))?;

    Ok(commit.id().to_string())
}

/// An update is refused only when `requested`'s nearest ancestor version
/// is strictly older than `installed`.
pub fn refuses_update(installed: &Version, requested: &Version) -> bool {
    requested < installed
}

pub fn version_tag_pattern() -> &'static str {
    VERSION_TAG_PATTERN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tag_regex_accepts_semver_tags() {
        assert_eq!(version_tag_regex_match("v1.2.3").unwrap(), Version::parse("1.2.3").unwrap());
        assert!(version_tag_regex_match("1.2.3").is_none());
        assert!(version_tag_regex_match("v1.2").is_none());
        assert!(version_tag_regex_match("release-v1.2.3").is_none());
    }

    #[test]
    fn is_commit_hash_requires_40_hex_chars() {
        assert!(is_commit_hash(&"a".repeat(40)));
        assert!(!is_commit_hash(&"a".repeat(39)));
        assert!(!is_commit_hash("not-hex-and-wrong-length"));
    }

    #[test]
    fn refuses_update_only_for_strictly_older_requested() {
        let v1 = Version::parse("1.0.0").unwrap();
        let v2 = Version::parse("2.0.0").unwrap();
        assert!(refuses_update(&v2, &v1));
        assert!(!refuses_update(&v1, &v2));
        assert!(!refuses_update(&v1, &v1));
    }

    #[test]
    fn has_version_and_latest_over_sorted_list() {
        let versions = vec![
            Version::parse("2.0.0").unwrap(),
            Version::parse("1.5.0").unwrap(),
            Version::parse("1.0.0").unwrap(),
        ];
        assert!(has_version(&versions, &Version::parse("1.5.0").unwrap()));
        assert!(!has_version(&versions, &Version::parse("9.9.9").unwrap()));
        assert_eq!(latest(&versions), Some(Version::parse("2.0.0").unwrap()));
    }

    fn commit_file(repo: &git2::Repository, path: &Path, contents: &str, message: &str) -> git2::Oid {
        std::fs::write(path, contents).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_path(path.strip_prefix(repo.workdir().unwrap()).unwrap())
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@example.com").unwrap();
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs).unwrap()
    }

    #[test]
    fn nearest_reachable_version_walks_ancestry_from_head() {
        let dir = tempdir::TempDir::new("git-nearest").unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();

        let v1 = commit_file(&repo, &dir.path().join("a.txt"), "1", "v1");
        repo.tag_lightweight("v1.0.0", &repo.find_object(v1, None).unwrap(), false)
            .unwrap();
        let _v2 = commit_file(&repo, &dir.path().join("a.txt"), "2", "v2");
        // no tag on this commit; HEAD now sits one ancestor past v1.0.0.

        let source = PackageSource { repo_path: dir.path().to_path_buf() };
        let versions = vec![Version::parse("1.0.0").unwrap()];
        let head = repo.head().unwrap().peel_to_commit().unwrap().id();
        let nearest = nearest_reachable_version(&source, &versions, head).unwrap();
        assert_eq!(nearest, Some(Version::parse("1.0.0").unwrap()));
    }

    #[test]
    fn nearest_reachable_version_walks_from_resolved_selector_not_head() {
        let dir = tempdir::TempDir::new("git-nearest-selector").unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();

        let v1 = commit_file(&repo, &dir.path().join("a.txt"), "1", "v1");
        repo.tag_lightweight("v1.0.0", &repo.find_object(v1, None).unwrap(), false)
            .unwrap();
        let v2 = commit_file(&repo, &dir.path().join("a.txt"), "2", "v2");
        repo.tag_lightweight("v2.0.0", &repo.find_object(v2, None).unwrap(), false)
            .unwrap();
        // HEAD now sits at v2.0.0; resolve a selector that names the older
        // commit and confirm the walk starts there, not at HEAD.
        let source = PackageSource { repo_path: dir.path().to_path_buf() };
        let versions = vec![Version::parse("2.0.0").unwrap(), Version::parse("1.0.0").unwrap()];

        let oid = resolve_selector_oid(&source, &v1.to_string()).unwrap();
        let nearest = nearest_reachable_version(&source, &versions, oid).unwrap();
        assert_eq!(nearest, Some(Version::parse("1.0.0").unwrap()));
    }
}
