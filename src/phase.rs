//! Phase definitions and the phase registry.
//!
//! This module provides:
//! - `PhaseKind`: the traversal discipline of a phase
//! - `PhaseAction`: the per-component work a phase performs
//! - `PhaseDefinition`: an immutable, named phase
//! - `PhaseRegistry`: the set of definitions built once at startup
//! - `PhaseContext`: the handle passed to every component hook

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::errors::{ActionError, GraphError};
use crate::objection::Objection;

/// Result type returned by component phase hooks.
pub type ActionResult = Result<(), ActionError>;

/// Common phases, in schedule order.
pub const COMMON_PHASES: [&str; 9] = [
    "build",
    "connect",
    "end_of_elaboration",
    "start_of_simulation",
    "run",
    "extract",
    "check",
    "report",
    "final",
];

/// Run-time sub-phases, in schedule order. They run alongside `run`.
pub const RUNTIME_PHASES: [&str; 12] = [
    "pre_reset",
    "reset",
    "post_reset",
    "pre_configure",
    "configure",
    "post_configure",
    "pre_main",
    "main",
    "post_main",
    "pre_shutdown",
    "shutdown",
    "post_shutdown",
];

/// Traversal discipline of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Parent before children; synchronous action
    TopDown,
    /// Children before parent; synchronous action
    BottomUp,
    /// Children before parent; one spawned activity per component
    Task,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TopDown => "top_down",
            Self::BottomUp => "bottom_up",
            Self::Task => "task",
        }
    }

    /// Check if this discipline spawns concurrent activities.
    pub fn is_task(self) -> bool {
        matches!(self, Self::Task)
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous per-component action.
pub type FunctionAction = Arc<dyn Fn(&dyn Component, &PhaseContext) -> ActionResult + Send + Sync>;

/// Per-component action that produces a spawned activity.
pub type TaskAction =
    Arc<dyn Fn(Arc<dyn Component>, PhaseContext) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// The work a phase performs on each component.
#[derive(Clone)]
pub enum PhaseAction {
    Function(FunctionAction),
    Task(TaskAction),
}

impl PhaseAction {
    /// Wrap a synchronous action.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&dyn Component, &PhaseContext) -> ActionResult + Send + Sync + 'static,
    {
        Self::Function(Arc::new(f))
    }

    /// Wrap an asynchronous action; each call becomes one spawned activity.
    pub fn task<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<dyn Component>, PhaseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        Self::Task(Arc::new(move |comp, ctx| Box::pin(f(comp, ctx))))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Function(_) => "function",
            Self::Task(_) => "task",
        }
    }
}

impl fmt::Debug for PhaseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhaseAction::{}", self.label())
    }
}

/// An immutable, named unit of work with a traversal discipline.
#[derive(Debug, Clone)]
pub struct PhaseDefinition {
    name: String,
    kind: PhaseKind,
    action: Option<PhaseAction>,
}

impl PhaseDefinition {
    /// Create a definition with no action attached.
    ///
    /// Executing such a phase is a fatal scheduling error.
    pub fn new(name: &str, kind: PhaseKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            action: None,
        }
    }

    /// Create a top-down function phase.
    pub fn top_down<F>(name: &str, f: F) -> Self
    where
        F: Fn(&dyn Component, &PhaseContext) -> ActionResult + Send + Sync + 'static,
    {
        Self::new(name, PhaseKind::TopDown).with_action(PhaseAction::function(f))
    }

    /// Create a bottom-up function phase.
    pub fn bottom_up<F>(name: &str, f: F) -> Self
    where
        F: Fn(&dyn Component, &PhaseContext) -> ActionResult + Send + Sync + 'static,
    {
        Self::new(name, PhaseKind::BottomUp).with_action(PhaseAction::function(f))
    }

    /// Create a task phase.
    pub fn task<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(Arc<dyn Component>, PhaseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        Self::new(name, PhaseKind::Task).with_action(PhaseAction::task(f))
    }

    /// Attach an action.
    pub fn with_action(mut self, action: PhaseAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    pub fn action(&self) -> Option<&PhaseAction> {
        self.action.as_ref()
    }

    pub fn is_task(&self) -> bool {
        self.kind.is_task()
    }
}

/// Phase definitions retrievable by name.
///
/// Built once at startup and passed by reference into graph construction.
#[derive(Debug, Clone, Default)]
pub struct PhaseRegistry {
    phases: Vec<Arc<PhaseDefinition>>,
    index: HashMap<String, usize>,
}

impl PhaseRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the common and run-time phases.
    ///
    /// Each standard phase invokes the `Component` hook of the same name.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for definition in standard_phases() {
            // Standard names are distinct, so registration cannot collide.
            let _ = registry.register(definition);
        }
        registry
    }

    /// Add a definition. Names must be unique.
    pub fn register(&mut self, definition: PhaseDefinition) -> Result<Arc<PhaseDefinition>, GraphError> {
        if self.index.contains_key(definition.name()) {
            return Err(GraphError::DuplicatePhase(definition.name().to_string()));
        }
        let definition = Arc::new(definition);
        self.index
            .insert(definition.name().to_string(), self.phases.len());
        self.phases.push(definition.clone());
        Ok(definition)
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Option<Arc<PhaseDefinition>> {
        self.index.get(name).map(|&i| self.phases[i].clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Registered phase names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(|p| p.name())
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

macro_rules! task_phase {
    ($name:expr, $hook:ident) => {
        PhaseDefinition::task($name, |comp: Arc<dyn Component>, ctx: PhaseContext| async move {
            comp.$hook(&ctx).await
        })
    };
}

fn standard_phases() -> Vec<PhaseDefinition> {
    vec![
        PhaseDefinition::top_down("build", |c, p| c.build_phase(p)),
        PhaseDefinition::bottom_up("connect", |c, p| c.connect_phase(p)),
        PhaseDefinition::bottom_up("end_of_elaboration", |c, p| c.end_of_elaboration_phase(p)),
        PhaseDefinition::bottom_up("start_of_simulation", |c, p| c.start_of_simulation_phase(p)),
        task_phase!("run", run_phase),
        PhaseDefinition::bottom_up("extract", |c, p| c.extract_phase(p)),
        PhaseDefinition::bottom_up("check", |c, p| c.check_phase(p)),
        PhaseDefinition::bottom_up("report", |c, p| c.report_phase(p)),
        PhaseDefinition::bottom_up("final", |c, p| c.final_phase(p)),
        task_phase!("pre_reset", pre_reset_phase),
        task_phase!("reset", reset_phase),
        task_phase!("post_reset", post_reset_phase),
        task_phase!("pre_configure", pre_configure_phase),
        task_phase!("configure", configure_phase),
        task_phase!("post_configure", post_configure_phase),
        task_phase!("pre_main", pre_main_phase),
        task_phase!("main", main_phase),
        task_phase!("post_main", post_main_phase),
        task_phase!("pre_shutdown", pre_shutdown_phase),
        task_phase!("shutdown", shutdown_phase),
        task_phase!("post_shutdown", post_shutdown_phase),
    ]
}

/// Handle passed to every component hook.
///
/// Identifies the phase, domain and component being visited, and gives
/// access to the node's objection.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    phase: Arc<str>,
    domain: Arc<str>,
    component: String,
    objection: Arc<Objection>,
}

impl PhaseContext {
    pub fn new(phase: Arc<str>, domain: Arc<str>, component: String, objection: Arc<Objection>) -> Self {
        Self {
            phase,
            domain,
            component,
            objection,
        }
    }

    /// Name of the phase being executed.
    pub fn phase_name(&self) -> &str {
        &self.phase
    }

    /// Domain of the phase node being executed.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Full hierarchical name of the component being visited.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Raise one objection on behalf of this component.
    pub fn raise_objection(&self) {
        self.objection.raise(&self.component, 1);
    }

    /// Raise `count` objections on behalf of this component.
    pub fn raise_objections(&self, count: u32) {
        self.objection.raise(&self.component, count);
    }

    /// Drop one objection on behalf of this component.
    pub fn drop_objection(&self) {
        self.objection.lower(&self.component, 1);
    }

    /// Drop `count` objections on behalf of this component.
    pub fn drop_objections(&self, count: u32) {
        self.objection.lower(&self.component, count);
    }

    /// Total objections currently raised against this phase node.
    pub fn objection_count(&self) -> u32 {
        self.objection.count()
    }

    /// The node's objection, for callers that raise on behalf of other sources.
    pub fn objection(&self) -> &Arc<Objection> {
        &self.objection
    }
}
