//! Component trait and the component hierarchy.
//!
//! Components are the units the scheduler synchronizes. Each one receives
//! four sub-events per phase node it participates in:
//!
//! | Sub-event | Hook | Delivered |
//! |-----------|------|-----------|
//! | started | [`Component::phase_started`] | once, top-most first |
//! | executing | the phase's action hook (`build_phase`, `run_phase`, ...) | once, in discipline order |
//! | ready to end | [`Component::phase_ready_to_end`] | one or more times |
//! | ended | [`Component::phase_ended`] | once, reverse of started order |
//!
//! The [`Hierarchy`] owns the tree: names, parent/child links in
//! registration order, and each component's domain assignment. The
//! scheduler borrows it immutably for a whole run, so the tree cannot be
//! restructured while phases execute.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::HierarchyError;
use crate::phase::{ActionResult, PhaseContext};

/// Domain every component belongs to unless reassigned.
pub const DEFAULT_DOMAIN: &str = "uvm";

/// A participant in phase scheduling.
///
/// Every hook has a no-op default; implement only the phases the component
/// takes part in. Components must be `Send + Sync` because task-phase hooks
/// run on spawned activities; use interior mutability for state.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Called before the phase's action runs anywhere in the tree.
    fn phase_started(&self, _phase: &PhaseContext) {}

    /// Called once the phase's termination condition holds.
    ///
    /// Raising an objection here sends the phase back to executing.
    fn phase_ready_to_end(&self, _phase: &PhaseContext) {}

    /// Called after the phase has ended and its activities were cancelled.
    fn phase_ended(&self, _phase: &PhaseContext) {}

    fn build_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    fn connect_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    fn end_of_elaboration_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    fn start_of_simulation_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    /// Long-running activity for the `run` phase.
    ///
    /// Returning does not end the phase; raise an objection to keep it open.
    async fn run_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    async fn pre_reset_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    async fn reset_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    async fn post_reset_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    async fn pre_configure_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    async fn configure_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    async fn post_configure_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    async fn pre_main_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    async fn main_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    async fn post_main_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    async fn pre_shutdown_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    async fn shutdown_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    async fn post_shutdown_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    fn extract_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    fn check_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    fn report_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    fn final_phase(&self, _phase: &PhaseContext) -> ActionResult {
        Ok(())
    }

    /// Returns this component as a [`Sequencer`] if supported.
    ///
    /// # Default
    ///
    /// Returns `None` - component has no sequencer hooks.
    fn as_sequencer(&self) -> Option<&dyn Sequencer> {
        None
    }
}

/// Capability for components that drive per-phase sequences.
///
/// Only invoked around task phases: `start_phase_sequence` right after the
/// component's `phase_started`, `stop_phase_sequence` right before its
/// `phase_ended`.
pub trait Sequencer: Send + Sync {
    fn start_phase_sequence(&self, phase: &PhaseContext) -> ActionResult;

    fn stop_phase_sequence(&self, phase: &PhaseContext);
}

/// Index of a component within its [`Hierarchy`].
///
/// Ids are only minted by the hierarchy that owns the component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(usize);

impl ComponentId {
    pub fn index(self) -> usize {
        self.0
    }
}

struct Entry {
    name: String,
    full_name: String,
    parent: Option<ComponentId>,
    children: Vec<ComponentId>,
    domain: String,
    component: Arc<dyn Component>,
}

/// Tree of components with registration-ordered children.
pub struct Hierarchy {
    entries: Vec<Entry>,
    by_name: HashMap<String, ComponentId>,
}

impl Hierarchy {
    /// Create a hierarchy with a single root component.
    pub fn new(root_name: &str, root: Arc<dyn Component>) -> Result<Self, HierarchyError> {
        validate_name(root_name)?;
        let mut by_name = HashMap::new();
        by_name.insert(root_name.to_string(), ComponentId(0));
        Ok(Self {
            entries: vec![Entry {
                name: root_name.to_string(),
                full_name: root_name.to_string(),
                parent: None,
                children: Vec::new(),
                domain: DEFAULT_DOMAIN.to_string(),
                component: root,
            }],
            by_name,
        })
    }

    /// Register a child under `parent`. The child inherits the parent's domain.
    pub fn add_child(
        &mut self,
        parent: ComponentId,
        name: &str,
        component: Arc<dyn Component>,
    ) -> Result<ComponentId, HierarchyError> {
        validate_name(name)?;
        let parent_entry = self
            .entries
            .get(parent.0)
            .ok_or(HierarchyError::UnknownComponent(parent.0))?;

        let full_name = format!("{}.{}", parent_entry.full_name, name);
        if self.by_name.contains_key(&full_name) {
            return Err(HierarchyError::DuplicateChild {
                parent: parent_entry.full_name.clone(),
                name: name.to_string(),
            });
        }

        let id = ComponentId(self.entries.len());
        let domain = parent_entry.domain.clone();
        self.entries.push(Entry {
            name: name.to_string(),
            full_name: full_name.clone(),
            parent: Some(parent),
            children: Vec::new(),
            domain,
            component,
        });
        self.entries[parent.0].children.push(id);
        self.by_name.insert(full_name, id);
        Ok(id)
    }

    /// Assign a component, and every descendant, to `domain`.
    pub fn set_domain(&mut self, id: ComponentId, domain: &str) -> Result<(), HierarchyError> {
        if id.0 >= self.entries.len() {
            return Err(HierarchyError::UnknownComponent(id.0));
        }
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let entry = &mut self.entries[current.0];
            entry.domain = domain.to_string();
            stack.extend(entry.children.iter().copied());
        }
        Ok(())
    }

    /// Assign a single component to `domain`, leaving its descendants alone.
    pub fn set_domain_local(&mut self, id: ComponentId, domain: &str) -> Result<(), HierarchyError> {
        let entry = self
            .entries
            .get_mut(id.0)
            .ok_or(HierarchyError::UnknownComponent(id.0))?;
        entry.domain = domain.to_string();
        Ok(())
    }

    pub fn root(&self) -> ComponentId {
        ComponentId(0)
    }

    /// Number of components in the tree.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false; a hierarchy has at least its root.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn name(&self, id: ComponentId) -> &str {
        &self.entries[id.0].name
    }

    /// Dotted path from the root, e.g. `tb.env.agent`.
    pub fn full_name(&self, id: ComponentId) -> &str {
        &self.entries[id.0].full_name
    }

    pub fn parent(&self, id: ComponentId) -> Option<ComponentId> {
        self.entries[id.0].parent
    }

    /// Children in registration order.
    pub fn children(&self, id: ComponentId) -> &[ComponentId] {
        &self.entries[id.0].children
    }

    pub fn has_first_child(&self, id: ComponentId) -> bool {
        !self.entries[id.0].children.is_empty()
    }

    pub fn first_child(&self, id: ComponentId) -> Option<ComponentId> {
        self.entries[id.0].children.first().copied()
    }

    /// The sibling registered right after `id`, if any.
    pub fn next_sibling(&self, id: ComponentId) -> Option<ComponentId> {
        let parent = self.entries[id.0].parent?;
        let siblings = &self.entries[parent.0].children;
        let pos = siblings.iter().position(|&c| c == id)?;
        siblings.get(pos + 1).copied()
    }

    /// Domain the component is currently assigned to.
    pub fn domain_of(&self, id: ComponentId) -> &str {
        &self.entries[id.0].domain
    }

    pub fn component(&self, id: ComponentId) -> &Arc<dyn Component> {
        &self.entries[id.0].component
    }

    /// Look up a component by its full name.
    pub fn find(&self, full_name: &str) -> Option<ComponentId> {
        self.by_name.get(full_name).copied()
    }

    /// Distinct domains assigned to components, sorted.
    pub fn domains(&self) -> Vec<&str> {
        let mut domains: Vec<&str> = self.entries.iter().map(|e| e.domain.as_str()).collect();
        domains.sort_unstable();
        domains.dedup();
        domains
    }
}

impl fmt::Debug for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|e| format!("{} ({})", e.full_name, e.domain)),
            )
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), HierarchyError> {
    if name.is_empty() || name.contains('.') {
        return Err(HierarchyError::InvalidName(name.to_string()));
    }
    Ok(())
}
