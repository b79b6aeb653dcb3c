//! Configuration for phasegraph.
//!
//! Settings are layered: `phasegraph.toml` first, then environment
//! overrides (`PHASEGRAPH_TRACE`, `PHASEGRAPH_GLOBAL_TIMEOUT_MS`), then CLI
//! flags applied by the caller.
//!
//! ```toml
//! [scheduler]
//! global_timeout_ms = 9200000
//! timeout_policy = "fatal"
//! max_ready_to_end_iterations = 20
//! phase_trace = false
//!
//! [timeouts]
//! "tb.main" = 5000
//! "*.pre*" = 0
//!
//! [domains]
//! runtime = ["uvm"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::component::DEFAULT_DOMAIN;
use crate::dag::{
    COMMON_DOMAIN, DEFAULT_GLOBAL_TIMEOUT, DEFAULT_MAX_READY_TO_END_ITERATIONS, GraphBuilder,
    PhaseGraph, SchedulerConfig, TimeoutPolicy,
};
use crate::demo::DemoConfig;
use crate::errors::GraphError;
use crate::phase::PhaseRegistry;

/// Default config file name.
pub const CONFIG_FILE: &str = "phasegraph.toml";

/// Env var toggling phase tracing.
pub const ENV_TRACE: &str = "PHASEGRAPH_TRACE";

/// Env var overriding the global timeout in milliseconds.
pub const ENV_GLOBAL_TIMEOUT_MS: &str = "PHASEGRAPH_GLOBAL_TIMEOUT_MS";

/// Lookup of per-phase timeouts, scoped by component path.
pub trait TimeoutSource: Send + Sync {
    /// Timeout for `phase` as seen from the component at `scope`.
    ///
    /// `None` means no per-phase bound applies.
    fn phase_timeout(&self, scope: &str, phase: &str) -> Option<Duration>;

    /// Timeout for `phase` of a node in `domain`.
    ///
    /// Falls back to [`phase_timeout`](Self::phase_timeout) unless the
    /// source distinguishes domains.
    fn domain_phase_timeout(&self, scope: &str, _domain: &str, phase: &str) -> Option<Duration> {
        self.phase_timeout(scope, phase)
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Global bound in milliseconds; zero or negative disables it
    #[serde(default = "default_global_timeout_ms")]
    pub global_timeout_ms: i64,
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
    #[serde(default = "default_max_ready_to_end_iterations")]
    pub max_ready_to_end_iterations: u32,
    #[serde(default)]
    pub phase_trace: bool,
}

fn default_global_timeout_ms() -> i64 {
    DEFAULT_GLOBAL_TIMEOUT.as_millis() as i64
}

fn default_max_ready_to_end_iterations() -> u32 {
    DEFAULT_MAX_READY_TO_END_ITERATIONS
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            global_timeout_ms: default_global_timeout_ms(),
            timeout_policy: TimeoutPolicy::default(),
            max_ready_to_end_iterations: default_max_ready_to_end_iterations(),
            phase_trace: false,
        }
    }
}

/// `[domains]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainsSection {
    /// Runtime domains wedged between `start_of_simulation` and `extract`
    #[serde(default = "default_runtime_domains")]
    pub runtime: Vec<String>,
}

fn default_runtime_domains() -> Vec<String> {
    vec![DEFAULT_DOMAIN.to_string()]
}

impl Default for DomainsSection {
    fn default() -> Self {
        Self {
            runtime: default_runtime_domains(),
        }
    }
}

/// `[timeouts]` section: `"<component path>.<phase>"` pattern to milliseconds.
///
/// Patterns support `*` and `?`. An exact key wins over patterns; among
/// patterns the longest match wins. Zero or negative values disable the
/// per-phase bound. A key suffixed with `@<domain>` (e.g. `"tb.main@uvm"`)
/// only applies to that domain's node and wins over unsuffixed keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeoutTable(BTreeMap<String, i64>);

impl TimeoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout for a pattern.
    pub fn insert(&mut self, pattern: impl Into<String>, millis: i64) {
        self.0.insert(pattern.into(), millis);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Raw value configured for `key`, exact match first.
    pub fn lookup(&self, key: &str) -> Option<i64> {
        if let Some(&millis) = self.0.get(key) {
            return Some(millis);
        }
        self.0
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, key))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, &millis)| millis)
    }

    /// Raw value for `key` in `domain`: `@<domain>` entries first, then
    /// [`lookup`](Self::lookup).
    pub fn lookup_in_domain(&self, key: &str, domain: &str) -> Option<i64> {
        let qualified = format!("{}@{}", key, domain);
        if let Some(&millis) = self.0.get(&qualified) {
            return Some(millis);
        }
        self.0
            .iter()
            .filter(|(pattern, _)| pattern.contains('@') && pattern_matches(pattern, &qualified))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, &millis)| millis)
            .or_else(|| self.lookup(key))
    }
}

fn positive_millis(millis: i64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis as u64))
}

impl TimeoutSource for TimeoutTable {
    fn phase_timeout(&self, scope: &str, phase: &str) -> Option<Duration> {
        positive_millis(self.lookup(&format!("{}.{}", scope, phase))?)
    }

    fn domain_phase_timeout(&self, scope: &str, domain: &str, phase: &str) -> Option<Duration> {
        positive_millis(self.lookup_in_domain(&format!("{}.{}", scope, phase), domain)?)
    }
}

/// The complete phasegraph.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PhasegraphToml {
    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Per-phase timeouts
    #[serde(default)]
    pub timeouts: TimeoutTable,
    /// Domain layout
    #[serde(default)]
    pub domains: DomainsSection,
    /// Demo testbench settings used by `phasegraph run`
    #[serde(default)]
    pub demo: DemoConfig,
}

impl PhasegraphToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse phasegraph.toml")
    }

    /// Load `phasegraph.toml` from `dir`.
    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize phasegraph.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_TRACE) {
            self.scheduler.phase_trace = parse_flag(&value)
                .with_context(|| format!("Invalid {}: '{}'", ENV_TRACE, value))?;
        }
        if let Some(value) = lookup(ENV_GLOBAL_TIMEOUT_MS) {
            self.scheduler.global_timeout_ms = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: '{}'", ENV_GLOBAL_TIMEOUT_MS, value))?;
        }
        Ok(())
    }

    /// Scheduler settings as a [`SchedulerConfig`].
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let global = self.scheduler.global_timeout_ms;
        SchedulerConfig::default()
            .with_global_timeout((global > 0).then(|| Duration::from_millis(global as u64)))
            .with_timeout_policy(self.scheduler.timeout_policy)
            .with_max_ready_to_end_iterations(self.scheduler.max_ready_to_end_iterations)
            .with_phase_trace(self.scheduler.phase_trace)
    }

    /// Build the common domain plus the configured runtime domains.
    pub fn build_graph(&self, registry: &PhaseRegistry) -> Result<PhaseGraph, GraphError> {
        let names: Vec<&str> = self.domains.runtime.iter().map(String::as_str).collect();
        GraphBuilder::with_runtime_domains(registry, &names)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.scheduler.global_timeout_ms <= 0 {
            warnings.push(
                "global_timeout_ms is not positive: task phases may wait forever".to_string(),
            );
        }

        if self.scheduler.max_ready_to_end_iterations == 0 {
            warnings.push(
                "max_ready_to_end_iterations is 0: ready-to-end is never queried".to_string(),
            );
        }

        for (pattern, millis) in self.timeouts.iter() {
            if !pattern.contains('.') {
                warnings.push(format!(
                    "Timeout pattern '{}' should have the form '<component path>.<phase>'",
                    pattern
                ));
            }
            if let Some((_, domain)) = pattern.rsplit_once('@')
                && !domain.contains(['*', '?'])
                && domain != COMMON_DOMAIN
                && !self.domains.runtime.iter().any(|d| d == domain)
            {
                warnings.push(format!(
                    "Timeout pattern '{}' names unknown domain '{}'",
                    pattern, domain
                ));
            }
            if millis <= 0 {
                warnings.push(format!(
                    "Timeout for '{}' is {}: the per-phase bound is disabled",
                    pattern, millis
                ));
            }
        }

        let mut seen = Vec::new();
        for domain in &self.domains.runtime {
            if domain == COMMON_DOMAIN {
                warnings.push(format!("Runtime domain cannot be named '{}'", COMMON_DOMAIN));
            } else if domain.is_empty() || domain.contains('.') {
                warnings.push(format!("Invalid runtime domain name '{}'", domain));
            } else if seen.contains(&domain) {
                warnings.push(format!("Runtime domain '{}' is listed twice", domain));
            }
            seen.push(domain);
        }

        warnings
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{}'", other),
    }
}

/// Check if a pattern matches a name.
/// Supports simple glob patterns:
/// - `*` matches any sequence of characters
/// - `?` matches any single character
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();

    glob_match(&pattern, &name)
}

/// Simple glob matching implementation.
fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => {
            // Skip consecutive stars
            let rest = {
                let skip = rest.iter().take_while(|&&c| c == '*').count();
                &rest[skip..]
            };
            if rest.is_empty() {
                return true;
            }
            (0..=text.len()).any(|i| glob_match(rest, &text[i..]))
        }
        Some(('?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}
