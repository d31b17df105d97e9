//! Data model shared by the package handler, data directory, and
//! orchestration engine: packages, profiles, instances, backups.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Kind of runtime type an option's value is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OptionType {
    Str,
    Int,
    Float,
    Bool,
    Port,
    PathDir,
    PathFile,
    Uri,
    Select,
    Id,
}

/// A validator attached to an option, type-directed by `OptionType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OptionValidator {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schemes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// A single tunable option declared by a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSpec {
    pub name: String,
    pub env_key: String,
    #[serde(rename = "type")]
    pub option_type: OptionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub help: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate: Option<OptionValidator>,
    #[serde(default)]
    pub hidden: bool,
}

/// Non-negative hardware requirements declared by a manifest or profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareRequirements {
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_gb: u64,
}

impl HardwareRequirements {
    pub fn is_valid(&self) -> bool {
        // all fields are unsigned already; kept as an explicit check so the
        // invariant ("hardware requirements non-negative") is enforced even
        // if a future field becomes signed.
        self.cpu_cores as i64 >= 0 && self.memory_mb as i64 >= 0 && self.disk_gb as i64 >= 0
    }
}

/// A plugin reference declared by a manifest or profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDecl {
    /// Relative path (inside the package) or URL#ref:subdir for a build context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_from: Option<String>,
    /// A pre-built image reference ("image:tag").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl PluginDecl {
    pub fn is_valid(&self) -> bool {
        self.build_from.is_some() ^ self.image.is_some()
    }
}

/// A monitoring scrape target declared by a profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitoringTargetSpec {
    pub service: String,
    pub port: u16,
    pub path: String,
}

/// The monitoring section of a profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSection {
    #[serde(default)]
    pub targets: Vec<MonitoringTargetSpec>,
    #[serde(default)]
    pub label: String,
}

/// Manifest describing a package (`pkg/manifest.yml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub node_version: String,
    pub name: String,
    pub upgrade: bool,
    pub profiles: Vec<String>,
    #[serde(default)]
    pub hardware: HardwareRequirements,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginDecl>,
}

/// A named configuration variant within a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub options: Vec<OptionSpec>,
    #[serde(default)]
    pub hardware: Option<HardwareRequirements>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginDecl>,
    #[serde(default)]
    pub monitoring: MonitoringSection,
    /// API health target: (container service, port, path).
    pub api_target: MonitoringTargetSpec,
}

/// Resolved plugin build/run source, as returned by `plugin_spec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "src", rename_all = "kebab-case")]
pub enum PluginSpec {
    RemoteGitContext(String),
    LocalArchiveContext(String),
    PreBuiltImage(String),
}

/// A monitoring target bound to a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitoringTarget {
    pub service: String,
    pub port: u16,
    pub path: String,
}

impl From<MonitoringTargetSpec> for MonitoringTarget {
    fn from(m: MonitoringTargetSpec) -> Self {
        Self {
            service: m.service,
            port: m.port,
            path: m.path,
        }
    }
}

/// Plugin record persisted on an instance, `{kind, source}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancePlugin {
    #[serde(rename = "type")]
    pub kind: PluginKind,
    pub src: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PluginKind {
    RemoteGitContext,
    LocalArchiveContext,
    PreBuiltImage,
}

/// `state.json` — the only persisted record of a materialized instance.
///
/// Exactly these fields; deserializing an object with any other top-level
/// key is rejected (`deny_unknown_fields`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Instance {
    pub name: String,
    pub url: String,
    pub version: String,
    pub profile: String,
    pub tag: String,
    pub monitoring: InstanceMonitoring,
    pub api_target: MonitoringTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<InstancePlugin>,
    pub commit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceMonitoring {
    pub targets: Vec<MonitoringTarget>,
}

impl Instance {
    /// `instance_id = name + "-" + tag`, unique across all instance directories.
    pub fn instance_id(&self) -> String {
        format!("{}-{}", self.name, self.tag)
    }

    /// Field-level validation required before `init_instance` persists this.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("name must not be empty".to_string());
        }
        if self.url.trim().is_empty() {
            problems.push("url must not be empty".to_string());
        }
        if self.version.trim().is_empty() {
            problems.push("version must not be empty".to_string());
        }
        if self.profile.trim().is_empty() {
            problems.push("profile must not be empty".to_string());
        }
        if self.tag.trim().is_empty() {
            problems.push("tag must not be empty".to_string());
        }
        let mut seen = HashSet::new();
        for target in &self.monitoring.targets {
            if target.service.trim().is_empty() {
                problems.push("monitoring target service must not be empty".to_string());
            }
            if !seen.insert((target.service.clone(), target.port)) {
                problems.push(format!(
                    "duplicate monitoring target {}:{}",
                    target.service, target.port
                ));
            }
        }
        if problems.is_empty() { Ok(()) } else { Err(problems) }
    }
}

/// Identity of a backup archive: `<instance_id>-<unix_ts>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupId {
    pub instance_id: String,
    pub timestamp: u64,
}

impl BackupId {
    pub fn new(instance_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            instance_id: instance_id.into(),
            timestamp,
        }
    }

    /// `instance_id-unix_ts`, also the file stem.
    pub fn format(&self) -> String {
        format!("{}-{}", self.instance_id, self.timestamp)
    }

    /// Inverse of `format`: splits on the last `-` since `instance_id` may
    /// itself contain hyphens (`name-tag`).
    pub fn parse(formatted: &str) -> Option<Self> {
        let (prefix, ts) = formatted.rsplit_once('-')?;
        let timestamp = ts.parse::<u64>().ok()?;
        if prefix.is_empty() {
            return None;
        }
        Some(Self {
            instance_id: prefix.to_string(),
            timestamp,
        })
    }
}

impl std::fmt::Display for BackupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format())
    }
}

/// State of the shared monitoring stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum MonitoringState {
    NotInstalled,
    InstalledStopped,
    InstalledRunning,
    Broken,
}

/// State of an installed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum InstanceState {
    Absent,
    Staging,
    InstalledStopped,
    InstalledRunning,
    Broken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_id_round_trips() {
        let id = BackupId::new("mock-avs-default", 1_700_000_000);
        let formatted = id.format();
        assert_eq!(BackupId::parse(&formatted), Some(id));
    }

    #[test]
    fn backup_id_parse_rejects_malformed() {
        assert!(BackupId::parse("no-timestamp-here").is_none());
        assert!(BackupId::parse("1234").is_none());
    }

    #[test]
    fn plugin_decl_requires_exactly_one_source() {
        assert!(!PluginDecl { build_from: None, image: None }.is_valid());
        assert!(
            !PluginDecl {
                build_from: Some("x".into()),
                image: Some("y".into())
            }
            .is_valid()
        );
        assert!(
            PluginDecl {
                build_from: Some("x".into()),
                image: None
            }
            .is_valid()
        );
    }

    #[test]
    fn instance_id_combines_name_and_tag() {
        let instance = Instance {
            name: "mock-avs".into(),
            url: "https://example.com/mock-avs".into(),
            version: "v1.0.0".into(),
            profile: "default".into(),
            tag: "default".into(),
            monitoring: InstanceMonitoring::default(),
            api_target: MonitoringTarget { service: "svc".into(), port: 8080, path: "/health".into() },
            plugin: None,
            commit: "a".repeat(40),
        };
        assert_eq!(instance.instance_id(), "mock-avs-default");
        assert!(instance.validate().is_ok());
    }

    #[test]
    fn instance_validate_rejects_duplicate_monitoring_targets() {
        let target = MonitoringTarget { service: "svc".into(), port: 9000, path: "/metrics".into() };
        let instance = Instance {
            name: "mock-avs".into(),
            url: "https://example.com/mock-avs".into(),
            version: "v1.0.0".into(),
            profile: "default".into(),
            tag: "default".into(),
            monitoring: InstanceMonitoring { targets: vec![target.clone(), target] },
            api_target: MonitoringTarget { service: "svc".into(), port: 8080, path: "/health".into() },
            plugin: None,
            commit: "a".repeat(40),
        };
        assert!(instance.validate().is_err());
    }
}
