//! Test doubles shared by the scheduler integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use phasegraph::component::{Component, Hierarchy};
use phasegraph::dag::COMMON_DOMAIN;
use phasegraph::phase::{ActionResult, PhaseContext, PhaseDefinition, PhaseKind};

/// Ordered record of hook calls, `"<event>:<domain>.<phase>:<component>"`.
#[derive(Default)]
pub struct Log(Mutex<Vec<String>>);

impl Log {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries starting with `prefix`, with the prefix stripped.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

fn record(log: &Log, event: &str, phase: &PhaseContext) {
    log.push(format!(
        "{}:{}.{}:{}",
        event,
        phase.domain(),
        phase.phase_name(),
        phase.component()
    ));
}

/// Records every sub-event it receives.
///
/// With `rearm` set, the first ready-to-end query of that phase raises an
/// objection that is dropped `hold` later.
pub struct Recorder {
    pub log: Arc<Log>,
    pub rearm: Option<(String, Duration)>,
    rearmed: AtomicU32,
    /// Re-raise on every query instead of only the first
    always: bool,
}

impl Recorder {
    pub fn new(log: &Arc<Log>) -> Self {
        Self {
            log: log.clone(),
            rearm: None,
            rearmed: AtomicU32::new(0),
            always: false,
        }
    }

    pub fn rearming(log: &Arc<Log>, phase: &str, hold: Duration) -> Self {
        Self {
            rearm: Some((phase.to_string(), hold)),
            ..Self::new(log)
        }
    }

    /// Raise on every ready-to-end query, not just the first.
    pub fn always(mut self) -> Self {
        self.always = true;
        self
    }

    pub fn rearms(&self) -> u32 {
        self.rearmed.load(Ordering::SeqCst)
    }
}

impl Component for Recorder {
    fn phase_started(&self, phase: &PhaseContext) {
        record(&self.log, "started", phase);
    }

    fn phase_ready_to_end(&self, phase: &PhaseContext) {
        record(&self.log, "ready", phase);
        let Some((name, hold)) = &self.rearm else {
            return;
        };
        if name != phase.phase_name() || (!self.always && self.rearms() > 0) {
            return;
        }
        self.rearmed.fetch_add(1, Ordering::SeqCst);
        phase.raise_objection();
        let phase = phase.clone();
        let hold = *hold;
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            phase.drop_objection();
        });
    }

    fn phase_ended(&self, phase: &PhaseContext) {
        record(&self.log, "ended", phase);
    }
}

/// `tb` with `env`, `env.agent`, `env.agent.driver` and `env.sb`, all recorders.
pub fn recorder_tree(log: &Arc<Log>) -> Hierarchy {
    let recorder = || -> Arc<dyn Component> { Arc::new(Recorder::new(log)) };
    let mut h = Hierarchy::new("tb", recorder()).unwrap();
    let env = h.add_child(h.root(), "env", recorder()).unwrap();
    let agent = h.add_child(env, "agent", recorder()).unwrap();
    h.add_child(agent, "driver", recorder()).unwrap();
    h.add_child(env, "sb", recorder()).unwrap();
    h
}

/// Function phase that logs `exec:<domain>.<phase>:<component>`.
pub fn recording_phase(name: &str, kind: PhaseKind, log: &Arc<Log>) -> PhaseDefinition {
    let log = log.clone();
    let action = move |_: &dyn Component, p: &PhaseContext| -> ActionResult {
        record(&log, "exec", p);
        Ok(())
    };
    match kind {
        PhaseKind::TopDown => PhaseDefinition::top_down(name, action),
        PhaseKind::BottomUp | PhaseKind::Task => PhaseDefinition::bottom_up(name, action),
    }
}

/// Task phase whose activities each hold one objection for `hold`.
pub fn busy_phase(name: &str, hold: Duration) -> PhaseDefinition {
    PhaseDefinition::task(name, move |_, ctx: PhaseContext| async move {
        ctx.raise_objection();
        tokio::time::sleep(hold).await;
        ctx.drop_objection();
        Ok(())
    })
}

/// Task phase whose activities return at once without objecting.
pub fn idle_phase(name: &str) -> PhaseDefinition {
    PhaseDefinition::task(name, |_, _| async { Ok(()) })
}

/// Label of a node in the common domain.
pub fn common(phase: &str) -> String {
    format!("{}.{}", COMMON_DOMAIN, phase)
}
