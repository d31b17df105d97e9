//! Manifest and profile parsing/validation.

use std::path::Path;

use crate::error::NodeError;
use crate::model::{Manifest, Profile};

/// Parse and schema-validate `pkg/manifest.yml`.
///
/// Required fields: `version, node_version, name, upgrade, profiles`;
/// hardware requirements non-negative; a plugin entry (if present) must
/// specify exactly one of a build-context reference or a pre-built image.
pub fn load_manifest(pkg_root: &Path) -> Result<Manifest, NodeError> {
    if !pkg_root.is_dir() {
        return Err(NodeError::DirNotFound {
            path: pkg_root.display().to_string(),
        });
    }

    let manifest_path = pkg_root.join("manifest.yml");
    let contents = std::fs::read_to_string(&manifest_path).map_err(|e| NodeError::InvalidConf {
        problems: vec![format!("failed to read {}: {}", manifest_path.display(), e)],
    })?;

    let manifest: Manifest = serde_yaml::from_str(&contents).map_err(|e| NodeError::InvalidConf {
        problems: vec![format!("failed to parse manifest: {}", e)],
    })?;

    validate_manifest(&manifest)?;
    Ok(manifest)
}

fn validate_manifest(manifest: &Manifest) -> Result<(), NodeError> {
    let mut problems = Vec::new();

    if manifest.version.trim().is_empty() {
        problems.push("manifest.version is required".to_string());
    }
    if manifest.node_version.trim().is_empty() {
        problems.push("manifest.node_version is required".to_string());
    }
    if manifest.name.trim().is_empty() {
        problems.push("manifest.name is required".to_string());
    }
    if manifest.profiles.is_empty() {
        problems.push("manifest.profiles must list at least one profile".to_string());
    }
    if !manifest.hardware.is_valid() {
        problems.push("manifest.hardware requirements must be non-negative".to_string());
    }
    if let Some(plugin) = &manifest.plugin
        && !plugin.is_valid()
    {
        problems.push(
            "manifest.plugin must specify exactly one of build_from or image".to_string(),
        );
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(NodeError::InvalidConf { problems })
    }
}

/// Load and validate a named profile from `pkg/<profile_name>/profile.yml`.
pub fn load_profile(pkg_root: &Path, profile_name: &str) -> Result<Profile, NodeError> {
    let profile_dir = pkg_root.join(profile_name);
    let profile_path = profile_dir.join("profile.yml");

    if !profile_path.is_file() {
        return Err(NodeError::ProfileNotFound {
            name: profile_name.to_string(),
        });
    }

    let contents = std::fs::read_to_string(&profile_path).map_err(|e| NodeError::InvalidConf {
        problems: vec![format!("failed to read {}: {}", profile_path.display(), e)],
    })?;

    let profile: Profile = serde_yaml::from_str(&contents).map_err(|e| NodeError::InvalidConf {
        problems: vec![format!("failed to parse profile '{}': {}", profile_name, e)],
    })?;

    validate_profile(&profile)?;
    Ok(profile)
}

fn validate_profile(profile: &Profile) -> Result<(), NodeError> {
    let mut problems = Vec::new();

    for option in &profile.options {
        if option.option_type == crate::model::OptionType::Select
            && option
                .validate
                .as_ref()
                .and_then(|v| v.options.as_ref())
                .is_none()
        {
            problems.push(format!(
                "option '{}': select type requires a validate.options list",
                option.name
            ));
        }
    }

    if let Some(plugin) = &profile.plugin
        && !plugin.is_valid()
    {
        problems.push(format!(
            "profile '{}': plugin must specify exactly one of build_from or image",
            profile.name
        ));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(NodeError::InvalidConf { problems })
    }
}

/// Load every profile listed in the manifest, aggregating all problems
/// across all profiles before returning instead of failing on the first.
pub fn load_profiles(pkg_root: &Path, manifest: &Manifest) -> Result<Vec<Profile>, NodeError> {
    let mut profiles = Vec::new();
    let mut problems = Vec::new();

    for name in &manifest.profiles {
        match load_profile(pkg_root, name) {
            Ok(profile) => profiles.push(profile),
            Err(NodeError::InvalidConf { problems: p }) => problems.extend(p),
            Err(other) => return Err(other),
        }
    }

    if !problems.is_empty() {
        return Err(NodeError::InvalidConf { problems });
    }

    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn write_manifest(dir: &Path, body: &str) {
        std::fs::write(dir.join("manifest.yml"), body).unwrap();
    }

    #[test]
    fn load_manifest_rejects_missing_fields() {
        let dir = TempDir::new("pkg").unwrap();
        write_manifest(dir.path(), "version: \"\"\nnode_version: \"\"\nname: \"\"\nupgrade: true\nprofiles: []\n");
        let err = load_manifest(dir.path()).unwrap_err();
        match err {
            NodeError::InvalidConf { problems } => assert!(problems.len() >= 3),
            other => panic!("expected InvalidConf, got {other:?}"),
        }
    }

    #[test]
    fn load_manifest_accepts_well_formed_manifest() {
        let dir = TempDir::new("pkg").unwrap();
        write_manifest(
            dir.path(),
            "version: v1.0.0\nnode_version: v1.0.0\nname: mock-avs\nupgrade: true\nprofiles:\n  - default\n",
        );
        let manifest = load_manifest(dir.path()).unwrap();
        assert_eq!(manifest.name, "mock-avs");
    }

    #[test]
    fn load_profile_missing_file_is_profile_not_found() {
        let dir = TempDir::new("pkg").unwrap();
        std::fs::create_dir_all(dir.path().join("default")).unwrap();
        let err = load_profile(dir.path(), "default").unwrap_err();
        assert!(matches!(err, NodeError::ProfileNotFound { .. }));
    }

    #[test]
    fn select_option_without_validate_block_is_invalid() {
        let dir = TempDir::new("pkg").unwrap();
        let profile_dir = dir.path().join("default");
        std::fs::create_dir_all(&profile_dir).unwrap();
        std::fs::write(
            profile_dir.join("profile.yml"),
            r#"
name: default
options:
  - name: choice
    env_key: CHOICE
    type: select
api_target:
  service: svc
  port: 8080
  path: /health
"#,
        )
        .unwrap();
        let err = load_profile(dir.path(), "default").unwrap_err();
        assert!(matches!(err, NodeError::InvalidConf { .. }));
    }
}
