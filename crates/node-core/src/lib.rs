//! eigenlayer-node - AVS node package lifecycle manager.
//!
//! Fetches, verifies, installs, runs, and upgrades EigenLayer AVS node
//! packages as Docker Compose deployments, alongside a shared Prometheus +
//! Grafana monitoring stack.

pub mod container;
pub mod datadir;
pub mod engine;
pub mod error;
pub mod model;
pub mod monitoring;
pub mod package;

mod fs_util;

pub use error::{NodeError, Result};
