//! Typed error hierarchy for the phase scheduler.
//!
//! Four enums cover the layers of the crate:
//! - `GraphError`: malformed domain/phase graphs, detected before a run
//! - `HierarchyError`: component tree construction failures
//! - `ActionError`: failures returned by a component's phase hooks
//! - `ScheduleError`: fatal conditions that halt a run

use std::time::Duration;

use thiserror::Error;

use crate::dag::NodeState;

/// Errors from assembling a phase graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Phase '{0}' is not registered")]
    UnknownPhase(String),

    #[error("Phase '{0}' is already registered")]
    DuplicatePhase(String),

    #[error("Node id {0} does not exist")]
    InvalidNode(usize),

    #[error("Domain '{domain}' already contains phase '{phase}'")]
    DuplicateNode { domain: String, phase: String },

    #[error("No phase '{phase}' in domain '{domain}'")]
    UnknownNode { domain: String, phase: String },

    #[error("Node '{0}' cannot precede itself")]
    SelfEdge(String),

    #[error("Cycle detected in phase graph. Involved nodes: {0:?}")]
    Cycle(Vec<String>),

    #[error("Phase graph has no nodes")]
    Empty,

    #[error("Phase graph has no '{0}' domain")]
    MissingCommonDomain(String),
}

/// Errors from building or querying the component hierarchy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HierarchyError {
    #[error("Component '{parent}' already has a child named '{name}'")]
    DuplicateChild { parent: String, name: String },

    #[error("Unknown component id {0}")]
    UnknownComponent(usize),

    #[error("Invalid component name '{0}': names must be non-empty and contain no '.'")]
    InvalidName(String),
}

/// Error returned by a component's phase hook.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ActionError {
    /// Build an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Fatal conditions that halt a scheduler run.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Phase '{phase}' in domain '{domain}' reached {state} with no action defined (component '{component}')")]
    MissingAction {
        phase: String,
        domain: String,
        state: NodeState,
        component: String,
    },

    #[error("Phase '{phase}' is a {kind} phase but its action is a {action} action (component '{component}')")]
    ActionKindMismatch {
        phase: String,
        kind: String,
        action: String,
        component: String,
    },

    #[error("Phase '{phase}' in domain '{domain}' failed at {state} for component '{component}': {source}")]
    ActionFailed {
        phase: String,
        domain: String,
        state: NodeState,
        component: String,
        #[source]
        source: ActionError,
    },

    #[error("Task activity for phase '{phase}' in domain '{domain}' panicked (component '{component}')")]
    TaskPanicked {
        phase: String,
        domain: String,
        component: String,
    },

    #[error("Phase '{phase}' in domain '{domain}' timed out after {bound:?} with objections still raised")]
    PhaseTimeout {
        phase: String,
        domain: String,
        bound: Duration,
    },

    #[error("Illegal transition for node '{node}': {from} -> {to}")]
    IllegalTransition {
        node: String,
        from: NodeState,
        to: NodeState,
    },
}

impl ScheduleError {
    /// Check if this error is a phase timeout rather than a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PhaseTimeout { .. })
    }
}
