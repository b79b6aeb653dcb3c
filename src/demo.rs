//! A small testbench used by `phasegraph run`.
//!
//! ```text
//! tb
//! └── env
//!     ├── agent      (sequencer)
//!     │   ├── driver
//!     │   └── monitor
//!     └── scoreboard
//! ```
//!
//! The driver holds `main` open with an objection while it sends its
//! transactions. The monitor watches during `run` without objecting and is
//! cancelled when `run` ends. The scoreboard asks for one more drain window
//! the first time `main` is ready to end, and fails `check` when the counts
//! disagree.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::component::{Component, Hierarchy, Sequencer};
use crate::errors::{ActionError, HierarchyError};
use crate::phase::{ActionResult, PhaseContext};

/// Settings for the demo testbench (`[demo]` in phasegraph.toml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Transactions the driver sends during `main`
    #[serde(default = "default_transactions")]
    pub transactions: u32,
    /// Delay between transactions
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Keep the `main` objection raised forever
    #[serde(default)]
    pub hang: bool,
}

fn default_transactions() -> u32 {
    4
}

fn default_interval_ms() -> u64 {
    10
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            transactions: default_transactions(),
            interval_ms: default_interval_ms(),
            hang: false,
        }
    }
}

impl DemoConfig {
    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Counters shared by the demo components.
#[derive(Debug, Default)]
pub struct DemoStats {
    pub sent: AtomicU32,
    pub observed: AtomicU32,
    pub sequences_started: AtomicU32,
    pub sequences_stopped: AtomicU32,
    pub checked: AtomicBool,
}

struct Testbench;

#[async_trait]
impl Component for Testbench {
    fn build_phase(&self, phase: &PhaseContext) -> ActionResult {
        info!(component = phase.component(), "building testbench");
        Ok(())
    }

    fn final_phase(&self, phase: &PhaseContext) -> ActionResult {
        info!(component = phase.component(), "testbench finished");
        Ok(())
    }
}

struct Env;

impl Component for Env {}

struct Agent {
    stats: Arc<DemoStats>,
}

impl Component for Agent {
    fn as_sequencer(&self) -> Option<&dyn Sequencer> {
        Some(self)
    }
}

impl Sequencer for Agent {
    fn start_phase_sequence(&self, phase: &PhaseContext) -> ActionResult {
        self.stats.sequences_started.fetch_add(1, Ordering::SeqCst);
        debug!(component = phase.component(), phase = phase.phase_name(), "sequence started");
        Ok(())
    }

    fn stop_phase_sequence(&self, phase: &PhaseContext) {
        self.stats.sequences_stopped.fetch_add(1, Ordering::SeqCst);
        debug!(component = phase.component(), phase = phase.phase_name(), "sequence stopped");
    }
}

struct Driver {
    config: DemoConfig,
    stats: Arc<DemoStats>,
}

#[async_trait]
impl Component for Driver {
    async fn reset_phase(&self, phase: &PhaseContext) -> ActionResult {
        phase.raise_objection();
        tokio::time::sleep(self.config.interval()).await;
        debug!(component = phase.component(), "reset applied");
        phase.drop_objection();
        Ok(())
    }

    async fn main_phase(&self, phase: &PhaseContext) -> ActionResult {
        phase.raise_objection();
        for n in 0..self.config.transactions {
            tokio::time::sleep(self.config.interval()).await;
            self.stats.sent.fetch_add(1, Ordering::SeqCst);
            debug!(component = phase.component(), n, "transaction sent");
        }
        if self.config.hang {
            std::future::pending::<()>().await;
        }
        phase.drop_objection();
        Ok(())
    }
}

struct Monitor {
    config: DemoConfig,
    stats: Arc<DemoStats>,
}

#[async_trait]
impl Component for Monitor {
    async fn run_phase(&self, _phase: &PhaseContext) -> ActionResult {
        let mut seen = 0;
        loop {
            tokio::time::sleep(self.config.interval() / 2).await;
            let sent = self.stats.sent.load(Ordering::SeqCst);
            if sent > seen {
                self.stats.observed.fetch_add(sent - seen, Ordering::SeqCst);
                seen = sent;
            }
        }
    }
}

struct Scoreboard {
    config: DemoConfig,
    stats: Arc<DemoStats>,
    extended: AtomicBool,
}

impl Component for Scoreboard {
    fn phase_ready_to_end(&self, phase: &PhaseContext) {
        if phase.phase_name() != "main" || self.extended.swap(true, Ordering::SeqCst) {
            return;
        }
        // One more window for the monitor to catch the last transaction.
        phase.raise_objection();
        let phase = phase.clone();
        let drain = self.config.interval();
        tokio::spawn(async move {
            tokio::time::sleep(drain).await;
            phase.drop_objection();
        });
    }

    fn check_phase(&self, phase: &PhaseContext) -> ActionResult {
        let sent = self.stats.sent.load(Ordering::SeqCst);
        let observed = self.stats.observed.load(Ordering::SeqCst);
        self.stats.checked.store(true, Ordering::SeqCst);
        if sent != observed {
            return Err(ActionError::msg(format!(
                "{} observed {} of {} transactions",
                phase.component(),
                observed,
                sent
            )));
        }
        Ok(())
    }

    fn report_phase(&self, phase: &PhaseContext) -> ActionResult {
        info!(
            component = phase.component(),
            sent = self.stats.sent.load(Ordering::SeqCst),
            observed = self.stats.observed.load(Ordering::SeqCst),
            "scoreboard report"
        );
        Ok(())
    }
}

/// Build the demo hierarchy.
pub fn testbench(config: &DemoConfig) -> Result<(Hierarchy, Arc<DemoStats>), HierarchyError> {
    let stats = Arc::new(DemoStats::default());

    let mut hierarchy = Hierarchy::new("tb", Arc::new(Testbench))?;
    let env = hierarchy.add_child(hierarchy.root(), "env", Arc::new(Env))?;
    let agent = hierarchy.add_child(
        env,
        "agent",
        Arc::new(Agent {
            stats: stats.clone(),
        }),
    )?;
    hierarchy.add_child(
        agent,
        "driver",
        Arc::new(Driver {
            config: config.clone(),
            stats: stats.clone(),
        }),
    )?;
    hierarchy.add_child(
        agent,
        "monitor",
        Arc::new(Monitor {
            config: config.clone(),
            stats: stats.clone(),
        }),
    )?;
    hierarchy.add_child(
        env,
        "scoreboard",
        Arc::new(Scoreboard {
            config: config.clone(),
            stats: stats.clone(),
            extended: AtomicBool::new(false),
        }),
    )?;

    Ok((hierarchy, stats))
}
