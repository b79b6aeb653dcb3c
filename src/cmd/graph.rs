//! Phase graph inspection (`phasegraph graph`).

use anyhow::{Context, Result};
use std::path::Path;

use phasegraph::phase::PhaseRegistry;

use super::load_config;

pub fn cmd_graph(project_dir: &Path, config_path: Option<&Path>, json: bool) -> Result<()> {
    let toml = load_config(project_dir, config_path)?;
    let registry = PhaseRegistry::standard();
    let graph = toml
        .build_graph(&registry)
        .context("Failed to build phase graph")?;
    let waves = graph.wave_labels();

    if json {
        println!("{}", serde_json::to_string_pretty(&waves)?);
        return Ok(());
    }

    println!();
    println!("Phase Graph");
    println!("===========");
    println!();
    for name in graph.domain_names() {
        let size = graph.domain(name).map_or(0, <[_]>::len);
        println!("  {} ({} phases)", name, size);
    }
    println!();
    for (i, wave) in waves.iter().enumerate() {
        println!("Wave {}: {}", i, wave.join(", "));
    }
    println!();
    Ok(())
}
