//! Layered configuration: defaults, then an optional `eigen.toml`, then
//! `EIGEN_*` environment variables, then CLI flags — figment's standard
//! provider-merge order, highest priority last.

use std::path::PathBuf;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the data directory; `None` lets `DataDir::default_root()` resolve it.
    pub data_root: Option<PathBuf>,
    /// Forwarded to the container driver via `DOCKER_API_VERSION` if set.
    pub docker_api_version: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self { data_root: None, docker_api_version: None }
    }
}

impl Config {
    /// Loads defaults, overlays `eigen.toml` if present, then `EIGEN_*` env vars.
    /// CLI flags are applied by the caller on top of the returned value.
    pub fn load() -> anyhow::Result<Self> {
        let config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("eigen.toml"))
            .merge(Env::prefixed("EIGEN_"))
            .extract()?;
        Ok(config)
    }
}
