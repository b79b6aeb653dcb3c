//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`            |
//! | `graph`  | `Graph`          |
//! | `config` | `Config`         |

pub mod config;
pub mod graph;
pub mod run;

pub use config::cmd_config;
pub use graph::cmd_graph;
pub use run::{RunOptions, cmd_run};

use anyhow::Result;
use phasegraph::config::{CONFIG_FILE, PhasegraphToml};
use std::path::{Path, PathBuf};

/// Resolve the config path: an explicit `--config`, else `<project_dir>/phasegraph.toml`.
pub fn config_path(project_dir: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => project_dir.join(CONFIG_FILE),
    }
}

/// Load the configuration, falling back to defaults when no file exists.
///
/// An explicit `--config` path must exist.
pub fn load_config(project_dir: &Path, explicit: Option<&Path>) -> Result<PhasegraphToml> {
    let path = config_path(project_dir, explicit);
    if path.exists() {
        PhasegraphToml::load(&path)
    } else if explicit.is_some() {
        anyhow::bail!("Config file not found: {}", path.display())
    } else {
        Ok(PhasegraphToml::default())
    }
}
