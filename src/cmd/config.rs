//! Configuration view and validation commands (`phasegraph config`).

use anyhow::Result;
use std::path::Path;

use phasegraph::config::{ENV_GLOBAL_TIMEOUT_MS, ENV_TRACE, PhasegraphToml};

use super::super::ConfigCommands;
use super::config_path;

pub fn cmd_config(
    project_dir: &Path,
    explicit: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_path = config_path(project_dir, explicit);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Phasegraph Configuration");
            println!("========================");
            println!();

            let mut toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                PhasegraphToml::load(&config_path)?
            } else {
                println!("No phasegraph.toml found at {}", config_path.display());
                println!("Using default configuration.");
                PhasegraphToml::default()
            };
            println!();
            print_toml(&toml);

            // Effective values (including env overrides)
            toml.apply_process_env()?;
            let scheduler = toml.scheduler_config();
            println!("Effective values (with {} / {}):", ENV_TRACE, ENV_GLOBAL_TIMEOUT_MS);
            match scheduler.global_timeout {
                Some(bound) => println!("  global_timeout = {} ms", bound.as_millis()),
                None => println!("  global_timeout = disabled"),
            }
            println!("  phase_trace = {}", scheduler.phase_trace);
            println!();

            if !config_path.exists() {
                println!("Run 'phasegraph config init' to create a phasegraph.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No phasegraph.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = PhasegraphToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("phasegraph.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                std::fs::create_dir_all(parent)?;
            }

            let toml = PhasegraphToml::default();
            toml.save(&config_path)?;

            println!("Created phasegraph.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [scheduler] global_timeout_ms, timeout_policy, phase_trace");
            println!("  - [timeouts] \"<component path>.<phase>\" = <ms>");
            println!("  - [domains] runtime");
            println!();
        }
    }

    Ok(())
}

fn print_toml(toml: &PhasegraphToml) {
    println!("[scheduler]");
    println!("  global_timeout_ms = {}", toml.scheduler.global_timeout_ms);
    println!(
        "  timeout_policy = \"{}\"",
        match toml.scheduler.timeout_policy {
            phasegraph::dag::TimeoutPolicy::Fatal => "fatal",
            phasegraph::dag::TimeoutPolicy::ForceEnd => "force_end",
        }
    );
    println!(
        "  max_ready_to_end_iterations = {}",
        toml.scheduler.max_ready_to_end_iterations
    );
    println!("  phase_trace = {}", toml.scheduler.phase_trace);
    println!();

    if !toml.timeouts.is_empty() {
        println!("[timeouts]");
        for (pattern, millis) in toml.timeouts.iter() {
            println!("  \"{}\" = {}", pattern, millis);
        }
        println!();
    }

    println!("[domains]");
    println!("  runtime = {:?}", toml.domains.runtime);
    println!();

    println!("[demo]");
    println!("  transactions = {}", toml.demo.transactions);
    println!("  interval_ms = {}", toml.demo.interval_ms);
    println!("  hang = {}", toml.demo.hang);
    println!();
}
