//! Scheduler bookkeeping: configuration, node states and readiness.
//!
//! The scheduler holds the mutable half of a run. The graph itself stays
//! immutable; every state change goes through [`PhaseScheduler::transition`],
//! which rejects anything but the next state in sequence (or the single
//! re-arm edge).

use crate::dag::builder::{NodeId, PhaseGraph};
use crate::dag::state::NodeState;
use crate::errors::ScheduleError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Default bound on a task phase waiting for its objections.
pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_millis(9_200_000);

/// Default number of ready-to-end re-arms before a node is ended anyway.
pub const DEFAULT_MAX_READY_TO_END_ITERATIONS: u32 = 20;

/// What happens when a task phase's objections outlive its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Halt the run with a phase timeout error
    #[default]
    Fatal,
    /// End the node anyway and record the timeout in the report
    ForceEnd,
}

/// Configuration for the phase scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Bound used when no per-phase timeout applies; `None` waits forever
    pub global_timeout: Option<Duration>,
    /// Reaction to an elapsed timeout
    pub timeout_policy: TimeoutPolicy,
    /// Re-arms allowed before the ready-to-end query is skipped
    pub max_ready_to_end_iterations: u32,
    /// Emit `info!` records for every sub-event and transition
    pub phase_trace: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_timeout: Some(DEFAULT_GLOBAL_TIMEOUT),
            timeout_policy: TimeoutPolicy::Fatal,
            max_ready_to_end_iterations: DEFAULT_MAX_READY_TO_END_ITERATIONS,
            phase_trace: false,
        }
    }
}

impl SchedulerConfig {
    /// Set the global timeout.
    pub fn with_global_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.global_timeout = timeout;
        self
    }

    /// Set the timeout policy.
    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Set the ready-to-end re-arm bound.
    pub fn with_max_ready_to_end_iterations(mut self, max: u32) -> Self {
        self.max_ready_to_end_iterations = max;
        self
    }

    /// Enable or disable phase tracing.
    pub fn with_phase_trace(mut self, trace: bool) -> Self {
        self.phase_trace = trace;
        self
    }
}

/// Per-run node states over an immutable graph.
#[derive(Debug)]
pub struct PhaseScheduler<'g> {
    graph: &'g PhaseGraph,
    states: Vec<NodeState>,
    ended: HashSet<NodeId>,
    /// Termination condition met since the node last entered Executing
    drained: Vec<bool>,
}

impl<'g> PhaseScheduler<'g> {
    /// Create a scheduler with every node dormant.
    pub fn new(graph: &'g PhaseGraph) -> Self {
        Self {
            graph,
            states: vec![NodeState::Dormant; graph.len()],
            ended: HashSet::new(),
            drained: vec![false; graph.len()],
        }
    }

    pub fn graph(&self) -> &'g PhaseGraph {
        self.graph
    }

    pub fn state(&self, id: NodeId) -> NodeState {
        self.states[id]
    }

    pub fn states(&self) -> &[NodeState] {
        &self.states
    }

    /// Move a node to `to`, returning the state it left.
    pub fn transition(&mut self, id: NodeId, to: NodeState) -> Result<NodeState, ScheduleError> {
        let from = self.states[id];
        if !from.can_transition_to(to) {
            return Err(ScheduleError::IllegalTransition {
                node: self.graph.label(id),
                from,
                to,
            });
        }
        self.states[id] = to;
        if to == NodeState::Ended {
            self.ended.insert(id);
        }
        if to == NodeState::Executing {
            self.drained[id] = false;
        }
        Ok(from)
    }

    /// Dormant nodes whose predecessors, and whose peers' predecessors, ended.
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        (0..self.states.len())
            .filter(|&id| self.states[id] == NodeState::Dormant)
            .filter(|&id| self.graph.dependencies_satisfied(id, &self.ended))
            .collect()
    }

    /// Record that an executing node met its termination condition.
    pub fn mark_drained(&mut self, id: NodeId) {
        self.drained[id] = true;
    }

    pub fn is_drained(&self, id: NodeId) -> bool {
        self.drained[id]
    }

    /// Sync groups whose members are all executing and drained.
    ///
    /// A group also waits until each of its siblings has at least drained.
    pub fn drained_groups(&self) -> Vec<Vec<NodeId>> {
        let mut seen = HashSet::new();
        let mut groups = Vec::new();
        for id in 0..self.states.len() {
            if self.states[id] != NodeState::Executing || !self.drained[id] || seen.contains(&id) {
                continue;
            }
            let group = self.graph.sync_group(id);
            seen.extend(group.iter().copied());
            let members_drained = group
                .iter()
                .all(|&m| self.states[m] == NodeState::Executing && self.drained[m]);
            if members_drained && group.iter().all(|&m| self.siblings_drained(m)) {
                groups.push(group);
            }
        }
        groups
    }

    fn siblings_drained(&self, id: NodeId) -> bool {
        let Some(node) = self.graph.node(id) else {
            return true;
        };
        node.siblings().iter().all(|&s| match self.states[s] {
            NodeState::Executing => self.drained[s],
            state => state > NodeState::Executing,
        })
    }

    /// Check if every node reached `Done`.
    pub fn is_complete(&self) -> bool {
        self.states.iter().all(|s| *s == NodeState::Done)
    }

    /// Labels of nodes that have not reached `Done`.
    pub fn unfinished(&self) -> Vec<String> {
        (0..self.states.len())
            .filter(|&id| self.states[id] != NodeState::Done)
            .map(|id| self.graph.label(id))
            .collect()
    }

    /// Get the number of ended nodes.
    pub fn ended_count(&self) -> usize {
        self.ended.len()
    }

    /// Get completion percentage.
    pub fn completion_percentage(&self) -> f64 {
        if self.states.is_empty() {
            return 100.0;
        }
        let done = self.states.iter().filter(|s| **s == NodeState::Done).count();
        (done as f64 / self.states.len() as f64) * 100.0
    }
}
