//! Package handler: fetch, verify, and interrogate AVS node packages;
//! resolve versions; extract profiles; render install artifacts.

pub mod checksum;
pub mod git;
pub mod manifest;
pub mod options;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use semver::Version;

use crate::error::NodeError;
use crate::model::{Manifest, PluginSpec, Profile};
use git::{GitAuth, PackageSource};

/// A fetched, checked-out package ready to be interrogated.
pub struct Package {
    pub source: PackageSource,
    pub checked_out: Option<String>,
}

impl Package {
    pub fn pkg_root(&self) -> PathBuf {
        self.source.repo_path.join("pkg")
    }

    pub fn checksum_file(&self) -> PathBuf {
        self.source.repo_path.join("pkg.sha256")
    }

    pub fn profile_dir(&self, profile_name: &str) -> PathBuf {
        self.pkg_root().join(profile_name)
    }

    pub fn compose_template_path(&self, profile_name: &str) -> PathBuf {
        self.profile_dir(profile_name).join("docker-compose.yml")
    }

    pub fn env_template_path(&self, profile_name: &str) -> PathBuf {
        self.profile_dir(profile_name).join(".env")
    }
}

pub struct PackageHandler;

impl PackageHandler {
    /// `fetch(url, auth?) -> pkg`.
    pub fn fetch(url: &str, auth: Option<&GitAuth>, scratch_dir: &Path) -> Result<Package, NodeError> {
        let source = git::fetch(url, auth, scratch_dir)?;
        Ok(Package {
            source,
            checked_out: None,
        })
    }

    /// Wrap a local package directory (`local-install`/`local-update`):
    /// no remote, no tags, no checkout — `pkg_root`/`checksum_file` are
    /// resolved directly under `path`. `verify`/`profiles` work the same
    /// as for a fetched package; `versions`/`checkout` are not meaningful
    /// and are not called by the orchestration engine's local-install path.
    pub fn local(path: &Path) -> Package {
        Package {
            source: PackageSource { repo_path: path.to_path_buf() },
            checked_out: Some("local".to_string()),
        }
    }

    /// `versions(pkg) -> [version]`.
    pub fn versions(pkg: &Package) -> Result<Vec<Version>, NodeError> {
        git::versions(&pkg.source)
    }

    pub fn has_version(pkg: &Package, v: &Version) -> Result<bool, NodeError> {
        Ok(git::has_version(&Self::versions(pkg)?, v))
    }

    pub fn latest(pkg: &Package) -> Result<Option<Version>, NodeError> {
        Ok(git::latest(&Self::versions(pkg)?))
    }

    pub fn current(pkg: &Package) -> Result<Option<Version>, NodeError> {
        let versions = Self::versions(pkg)?;
        git::current(&pkg.source, &versions)
    }

    /// `checkout(pkg, selector)`.
    pub fn checkout(pkg: &mut Package, selector: &str) -> Result<String, NodeError> {
        let commit = git::checkout(&pkg.source, selector)?;
        pkg.checked_out = Some(commit.clone());
        Ok(commit)
    }

    /// `verify(pkg)`.
    pub fn verify(pkg: &Package) -> Result<(), NodeError> {
        let checksum_path = pkg.checksum_file();
        let checksum_file = checksum_path.is_file().then_some(checksum_path);
        checksum::verify(&pkg.pkg_root(), checksum_file.as_ref())
    }

    /// `profiles(pkg) -> [profile]`.
    pub fn profiles(pkg: &Package) -> Result<(Manifest, Vec<Profile>), NodeError> {
        let pkg_root = pkg.pkg_root();
        let manifest = manifest::load_manifest(&pkg_root)?;
        let profiles = manifest::load_profiles(&pkg_root, &manifest)?;
        Ok((manifest, profiles))
    }

    /// Locate a single named profile, or `ProfileNotFound`.
    pub fn find_profile<'a>(profiles: &'a [Profile], name: &str) -> Result<&'a Profile, NodeError> {
        profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| NodeError::ProfileNotFound { name: name.to_string() })
    }

    /// `render_dotenv(pkg, profile, option_values) -> map<string,string>`:
    /// reads `pkg/<profile>/.env` as the starting template (absent file is
    /// an empty template, not an error) and overlays every option's
    /// resolved value on top of it.
    pub fn render_dotenv(
        pkg: &Package,
        profile: &Profile,
        option_values: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, NodeError> {
        let template_path = pkg.env_template_path(&profile.name);
        let template = if template_path.is_file() {
            let contents = std::fs::read_to_string(&template_path).map_err(|e| {
                NodeError::External(anyhow::anyhow!(e).context(format!(
                    "failed to read .env template {}",
                    template_path.display()
                )))
            })?;
            options::parse_dotenv(&contents)
        } else {
            BTreeMap::new()
        };
        options::render_dotenv_with_template(template, &profile.options, option_values)
    }

    /// `plugin_spec(pkg) -> {kind, source} | none`.
    ///
    /// Resolves the profile's plugin override if present, else the
    /// manifest's plugin entry, into a tagged variant. `instance_id` is
    /// needed because a `local-archive-context` source is the instance
    /// id the install step will tar the referenced subtree under
    /// (`plugin/<instance_id>.tar`), not the raw path.
    pub fn plugin_spec(
        manifest: &Manifest,
        profile: &Profile,
        instance_id: &str,
    ) -> Option<PluginSpec> {
        let decl = profile.plugin.as_ref().or(manifest.plugin.as_ref())?;

        if let Some(image) = &decl.image {
            return Some(PluginSpec::PreBuiltImage(image.clone()));
        }

        let build_from = decl.build_from.as_ref()?;
        if build_from.contains("://") || build_from.contains('#') {
            Some(PluginSpec::RemoteGitContext(build_from.clone()))
        } else {
            Some(PluginSpec::LocalArchiveContext(instance_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HardwareRequirements, PluginDecl};

    fn manifest() -> Manifest {
        Manifest {
            version: "1.0.0".into(),
            node_version: "1.0.0".into(),
            name: "mock-avs".into(),
            upgrade: true,
            profiles: vec!["default".into()],
            hardware: HardwareRequirements::default(),
            plugin: None,
        }
    }

    fn profile() -> Profile {
        Profile {
            name: "default".into(),
            options: vec![],
            hardware: None,
            plugin: None,
            monitoring: Default::default(),
            api_target: crate::model::MonitoringTargetSpec {
                service: "svc".into(),
                port: 8080,
                path: "/health".into(),
            },
        }
    }

    #[test]
    fn plugin_spec_none_without_declaration() {
        assert!(PackageHandler::plugin_spec(&manifest(), &profile(), "mock-avs-default").is_none());
    }

    #[test]
    fn plugin_spec_prebuilt_image() {
        let mut m = manifest();
        m.plugin = Some(PluginDecl { build_from: None, image: Some("img:tag".into()) });
        let spec = PackageHandler::plugin_spec(&m, &profile(), "mock-avs-default").unwrap();
        assert_eq!(spec, PluginSpec::PreBuiltImage("img:tag".into()));
    }

    #[test]
    fn plugin_spec_local_archive_context_uses_instance_id() {
        let mut m = manifest();
        m.plugin = Some(PluginDecl { build_from: Some("./plugins/tool".into()), image: None });
        let spec = PackageHandler::plugin_spec(&m, &profile(), "mock-avs-default").unwrap();
        assert_eq!(spec, PluginSpec::LocalArchiveContext("mock-avs-default".into()));
    }

    #[test]
    fn plugin_spec_remote_git_context_passthrough() {
        let mut m = manifest();
        m.plugin = Some(PluginDecl {
            build_from: Some("https://example.com/tool#main:docker".into()),
            image: None,
        });
        let spec = PackageHandler::plugin_spec(&m, &profile(), "mock-avs-default").unwrap();
        assert_eq!(
            spec,
            PluginSpec::RemoteGitContext("https://example.com/tool#main:docker".into())
        );
    }

    #[test]
    fn profile_plugin_overrides_manifest_plugin() {
        let mut m = manifest();
        m.plugin = Some(PluginDecl { build_from: None, image: Some("manifest-img:tag".into()) });
        let mut p = profile();
        p.plugin = Some(PluginDecl { build_from: None, image: Some("profile-img:tag".into()) });
        let spec = PackageHandler::plugin_spec(&m, &p, "mock-avs-default").unwrap();
        assert_eq!(spec, PluginSpec::PreBuiltImage("profile-img:tag".into()));
    }
}
