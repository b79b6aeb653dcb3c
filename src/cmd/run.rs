//! Demo testbench run (`phasegraph run`).

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::warn;

use phasegraph::dag::{PhaseExecutor, RunReport, SchedulerEvent, TimeoutPolicy};
use phasegraph::demo::{self, DemoStats};
use phasegraph::phase::PhaseRegistry;

use super::load_config;

/// Flags of `phasegraph run` that override the configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub trace: bool,
    pub timeout_ms: Option<i64>,
    pub force_end: bool,
    pub hang: bool,
    pub events: bool,
    pub json: bool,
}

pub async fn cmd_run(
    project_dir: &Path,
    config_path: Option<&Path>,
    options: &RunOptions,
) -> Result<()> {
    let mut toml = load_config(project_dir, config_path)?;
    toml.apply_process_env()?;

    // CLI flags win over file and env
    if options.trace {
        toml.scheduler.phase_trace = true;
    }
    if let Some(ms) = options.timeout_ms {
        toml.scheduler.global_timeout_ms = ms;
    }
    if options.force_end {
        toml.scheduler.timeout_policy = TimeoutPolicy::ForceEnd;
    }
    if options.hang {
        toml.demo.hang = true;
    }

    let registry = PhaseRegistry::standard();
    let graph = toml
        .build_graph(&registry)
        .context("Failed to build phase graph")?;
    let (hierarchy, stats) =
        demo::testbench(&toml.demo).context("Failed to build demo testbench")?;

    let mut executor = PhaseExecutor::new(&graph, &hierarchy, toml.scheduler_config())
        .with_timeouts(&toml.timeouts);

    let printer = if options.events {
        let (tx, mut rx) = mpsc::channel::<SchedulerEvent>(256);
        executor = executor.with_event_channel(tx);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "failed to serialize event"),
                }
            }
        }))
    } else {
        None
    };

    let result = executor.run().await;
    // Closes the event channel so the printer can finish
    drop(executor);
    if let Some(handle) = printer {
        handle.await.ok();
    }
    let report = result.context("Phase run failed")?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report, &stats);
    }
    Ok(())
}

fn print_summary(report: &RunReport, stats: &DemoStats) {
    println!();
    println!(
        "Phase run completed in {} ms",
        report.duration.as_millis()
    );
    println!("  nodes completed: {}", report.completed.len());
    println!("  transitions: {}", report.transitions.len());

    let mut rearms: Vec<_> = report.rearms.iter().collect();
    rearms.sort();
    for (node, count) in rearms {
        println!("  re-armed: {} x{}", node, count);
    }
    for timeout in &report.timeouts {
        println!(
            "  timed out: {} after {} ms ({} outstanding)",
            timeout.node,
            timeout.bound.as_millis(),
            timeout.outstanding
        );
    }
    if report.objection_misuse > 0 {
        println!("  objection misuse: {}", report.objection_misuse);
    }
    println!(
        "  transactions: sent {}, observed {}",
        stats.sent.load(Ordering::SeqCst),
        stats.observed.load(Ordering::SeqCst)
    );
    println!();
}
