//! Node state machine and run reporting for the phase scheduler.
//!
//! This module provides the per-node [`NodeState`] machine and the
//! [`RunReport`] that records every transition of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// State of a phase node within one run.
///
/// States are ordered; a node only moves to the next state in sequence,
/// except for the re-arm edge `ReadyToEnd -> Executing`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Initial state; predecessors not yet satisfied
    #[default]
    Dormant,
    /// All predecessors (and sync peers' predecessors) have ended
    Scheduled,
    /// `phase_started` delivered
    Started,
    /// Action delivered or spawned
    Executing,
    /// Termination condition held; `phase_ready_to_end` queried
    ReadyToEnd,
    /// Activities cancelled and `phase_ended` delivered
    Ended,
    /// Bookkeeping reset
    Cleanup,
    /// Node finished for this run
    Done,
}

impl NodeState {
    /// The next state in sequence, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Dormant => Some(Self::Scheduled),
            Self::Scheduled => Some(Self::Started),
            Self::Started => Some(Self::Executing),
            Self::Executing => Some(Self::ReadyToEnd),
            Self::ReadyToEnd => Some(Self::Ended),
            Self::Ended => Some(Self::Cleanup),
            Self::Cleanup => Some(Self::Done),
            Self::Done => None,
        }
    }

    /// Check if moving to `to` is a legal transition.
    pub fn can_transition_to(self, to: Self) -> bool {
        self.next() == Some(to) || (self == Self::ReadyToEnd && to == Self::Executing)
    }

    /// Check if the node has reached `Ended` or later.
    pub fn is_ended(self) -> bool {
        self >= Self::Ended
    }

    /// Check if the node is between `Scheduled` and `ReadyToEnd`.
    pub fn is_active(self) -> bool {
        self >= Self::Scheduled && self <= Self::ReadyToEnd
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dormant => "dormant",
            Self::Scheduled => "scheduled",
            Self::Started => "started",
            Self::Executing => "executing",
            Self::ReadyToEnd => "ready_to_end",
            Self::Ended => "ended",
            Self::Cleanup => "cleanup",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Node label ("domain.phase")
    pub node: String,
    pub from: NodeState,
    pub to: NodeState,
    /// Time since the run started
    #[serde(with = "duration_serde")]
    pub at: Duration,
}

/// A task phase that was forced to end by its timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutRecord {
    pub node: String,
    #[serde(with = "duration_serde")]
    pub bound: Duration,
    /// Objections still raised when the timeout fired
    pub outstanding: u32,
}

/// Record of a completed scheduler run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    /// Wall-clock start of the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Every node transition, in order
    pub transitions: Vec<Transition>,
    /// Node labels in the order they reached `Done`
    pub completed: Vec<String>,
    /// Nodes forced to end by a timeout
    pub timeouts: Vec<TimeoutRecord>,
    /// Ready-to-end re-arms per node label
    #[serde(default)]
    pub rearms: HashMap<String, u32>,
    /// Objection drops that exceeded their raises
    pub objection_misuse: u32,
    /// Total run time
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl RunReport {
    /// Create an empty report stamped with the current time.
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Time at which `node` first entered `state`.
    pub fn entered_at(&self, node: &str, state: NodeState) -> Option<Duration> {
        self.transitions
            .iter()
            .find(|t| t.node == node && t.to == state)
            .map(|t| t.at)
    }

    /// Position in the transition log at which `node` first entered `state`.
    pub fn position(&self, node: &str, state: NodeState) -> Option<usize> {
        self.transitions
            .iter()
            .position(|t| t.node == node && t.to == state)
    }

    /// The sequence of states `node` passed through.
    pub fn states_of(&self, node: &str) -> Vec<NodeState> {
        self.transitions
            .iter()
            .filter(|t| t.node == node)
            .map(|t| t.to)
            .collect()
    }

    /// Check if a node was forced to end by a timeout.
    pub fn timed_out(&self, node: &str) -> bool {
        self.timeouts.iter().any(|t| t.node == node)
    }
}

/// Tracks execution timing on the tokio clock.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
