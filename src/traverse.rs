//! Traversal disciplines over the component hierarchy.
//!
//! A [`Traversal`] binds one phase node (definition, domain, objection) to
//! the hierarchy and delivers the node's sub-events to every participating
//! component:
//!
//! - started: pre-order, top-most first
//! - executing: pre-order for top-down phases, post-order for bottom-up and
//!   task phases
//! - ready to end: same order as executing
//! - ended: exact reverse of the started order
//!
//! Task phases never run their action inline. Each component gets one
//! activity spawned into the node's `JoinSet`; the traversal returns as soon
//! as everything is spawned.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;

use crate::component::{Component, ComponentId, Hierarchy};
use crate::dag::{COMMON_DOMAIN, NodeState};
use crate::errors::{ActionError, ScheduleError};
use crate::objection::Objection;
use crate::phase::{PhaseAction, PhaseContext, PhaseDefinition, PhaseKind, TaskAction};

/// Components in pre-order: parent, then children in registration order.
pub fn pre_order(hierarchy: &Hierarchy) -> Vec<ComponentId> {
    let mut order = Vec::with_capacity(hierarchy.len());
    visit_pre(hierarchy, hierarchy.root(), &mut order);
    order
}

/// Components in post-order: children in registration order, then parent.
pub fn post_order(hierarchy: &Hierarchy) -> Vec<ComponentId> {
    let mut order = Vec::with_capacity(hierarchy.len());
    visit_post(hierarchy, hierarchy.root(), &mut order);
    order
}

fn visit_pre(hierarchy: &Hierarchy, id: ComponentId, order: &mut Vec<ComponentId>) {
    order.push(id);
    let mut child = hierarchy.first_child(id);
    while let Some(c) = child {
        visit_pre(hierarchy, c, order);
        child = hierarchy.next_sibling(c);
    }
}

fn visit_post(hierarchy: &Hierarchy, id: ComponentId, order: &mut Vec<ComponentId>) {
    let mut child = hierarchy.first_child(id);
    while let Some(c) = child {
        visit_post(hierarchy, c, order);
        child = hierarchy.next_sibling(c);
    }
    order.push(id);
}

/// Count of spawned activities that have not yet been polled once.
///
/// The executor waits for this to reach zero before looking at the
/// objection count, so every activity gets a chance to raise first.
#[derive(Debug)]
pub(crate) struct PendingActivities {
    tx: watch::Sender<usize>,
}

impl PendingActivities {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    fn add(&self) {
        self.tx.send_modify(|n| *n += 1);
    }

    fn done(&self) {
        self.tx.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub(crate) fn count(&self) -> usize {
        *self.tx.borrow()
    }

    pub(crate) async fn wait_for_zero(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Decrements the pending count exactly once.
struct PendingGuard(Arc<PendingActivities>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Releases its pending slot after the first poll of the inner future, or
/// on drop if it was aborted before ever running.
struct FirstPoll {
    inner: BoxFuture<'static, ActivityOutcome>,
    guard: Option<PendingGuard>,
}

impl Future for FirstPoll {
    type Output = ActivityOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let out = self.inner.as_mut().poll(cx);
        self.guard.take();
        out
    }
}

/// How one spawned activity finished.
#[derive(Debug)]
pub(crate) enum ActivityOutcome {
    Returned { component: String },
    Failed { component: String, error: ActionError },
    Panicked { component: String },
}

/// One phase node's view of the hierarchy.
pub(crate) struct Traversal<'a> {
    hierarchy: &'a Hierarchy,
    definition: &'a PhaseDefinition,
    phase: Arc<str>,
    domain: Arc<str>,
    objection: Arc<Objection>,
    trace: bool,
}

impl<'a> Traversal<'a> {
    pub(crate) fn new(
        hierarchy: &'a Hierarchy,
        definition: &'a PhaseDefinition,
        domain: &str,
        objection: Arc<Objection>,
        trace: bool,
    ) -> Self {
        Self {
            hierarchy,
            definition,
            phase: Arc::from(definition.name()),
            domain: Arc::from(domain),
            objection,
            trace,
        }
    }

    /// Check if a component receives this node's sub-events.
    pub(crate) fn applies_to(&self, id: ComponentId) -> bool {
        &*self.domain == COMMON_DOMAIN || self.hierarchy.domain_of(id) == &*self.domain
    }

    /// Participating components in pre-order.
    pub(crate) fn participants(&self) -> Vec<ComponentId> {
        pre_order(self.hierarchy)
            .into_iter()
            .filter(|&id| self.applies_to(id))
            .collect()
    }

    fn discipline_order(&self) -> Vec<ComponentId> {
        let order = match self.definition.kind() {
            PhaseKind::TopDown => pre_order(self.hierarchy),
            PhaseKind::BottomUp | PhaseKind::Task => post_order(self.hierarchy),
        };
        order.into_iter().filter(|&id| self.applies_to(id)).collect()
    }

    fn context(&self, id: ComponentId) -> PhaseContext {
        PhaseContext::new(
            self.phase.clone(),
            self.domain.clone(),
            self.hierarchy.full_name(id).to_string(),
            self.objection.clone(),
        )
    }

    fn trace(&self, state: NodeState, id: ComponentId) {
        if self.trace {
            info!(
                target: "phase_trace",
                phase = %self.phase,
                state = %state,
                component = self.hierarchy.full_name(id),
                domain = %self.domain,
                "phase sub-event"
            );
        }
    }

    fn failed(&self, state: NodeState, id: ComponentId, source: ActionError) -> ScheduleError {
        ScheduleError::ActionFailed {
            phase: self.phase.to_string(),
            domain: self.domain.to_string(),
            state,
            component: self.hierarchy.full_name(id).to_string(),
            source,
        }
    }

    /// Deliver `phase_started`, plus sequencer start for task phases.
    pub(crate) fn started(&self) -> Result<(), ScheduleError> {
        for id in self.participants() {
            self.trace(NodeState::Started, id);
            let ctx = self.context(id);
            let component = self.hierarchy.component(id);
            component.phase_started(&ctx);
            if self.definition.is_task()
                && let Some(sequencer) = component.as_sequencer()
            {
                sequencer
                    .start_phase_sequence(&ctx)
                    .map_err(|e| self.failed(NodeState::Started, id, e))?;
            }
        }
        Ok(())
    }

    /// Run the action on every participant, or spawn it for task phases.
    ///
    /// Function actions complete before this returns. Task activities are
    /// spawned into `tasks` and registered in `pending`.
    pub(crate) fn execute(
        &self,
        tasks: &mut JoinSet<ActivityOutcome>,
        pending: &Arc<PendingActivities>,
    ) -> Result<(), ScheduleError> {
        let root_name = || self.hierarchy.full_name(self.hierarchy.root()).to_string();
        let action = self
            .definition
            .action()
            .ok_or_else(|| ScheduleError::MissingAction {
                phase: self.phase.to_string(),
                domain: self.domain.to_string(),
                state: NodeState::Executing,
                component: root_name(),
            })?;

        match (self.definition.kind(), action) {
            (PhaseKind::TopDown | PhaseKind::BottomUp, PhaseAction::Function(f)) => {
                for id in self.discipline_order() {
                    self.trace(NodeState::Executing, id);
                    let ctx = self.context(id);
                    f(self.hierarchy.component(id).as_ref(), &ctx)
                        .map_err(|e| self.failed(NodeState::Executing, id, e))?;
                }
                Ok(())
            }
            (PhaseKind::Task, PhaseAction::Task(f)) => {
                for id in self.discipline_order() {
                    self.trace(NodeState::Executing, id);
                    pending.add();
                    let activity = FirstPoll {
                        inner: activity(f.clone(), self.hierarchy.component(id).clone(), self.context(id)),
                        guard: Some(PendingGuard(pending.clone())),
                    };
                    tasks.spawn(activity);
                }
                Ok(())
            }
            (kind, action) => Err(ScheduleError::ActionKindMismatch {
                phase: self.phase.to_string(),
                kind: kind.to_string(),
                action: action.label().to_string(),
                component: root_name(),
            }),
        }
    }

    /// Query `phase_ready_to_end` on every participant.
    pub(crate) fn ready_to_end(&self) {
        for id in self.discipline_order() {
            self.trace(NodeState::ReadyToEnd, id);
            self.hierarchy.component(id).phase_ready_to_end(&self.context(id));
        }
    }

    /// Deliver `phase_ended` in reverse started order, stopping sequencers
    /// first for task phases.
    pub(crate) fn ended(&self) {
        for id in self.participants().into_iter().rev() {
            self.trace(NodeState::Ended, id);
            let ctx = self.context(id);
            let component = self.hierarchy.component(id);
            if self.definition.is_task()
                && let Some(sequencer) = component.as_sequencer()
            {
                sequencer.stop_phase_sequence(&ctx);
            }
            component.phase_ended(&ctx);
        }
    }
}

fn activity(
    action: TaskAction,
    component: Arc<dyn Component>,
    ctx: PhaseContext,
) -> BoxFuture<'static, ActivityOutcome> {
    let name = ctx.component().to_string();
    async move {
        match AssertUnwindSafe(action(component, ctx)).catch_unwind().await {
            Ok(Ok(())) => ActivityOutcome::Returned { component: name },
            Ok(Err(error)) => ActivityOutcome::Failed {
                component: name,
                error,
            },
            Err(_) => ActivityOutcome::Panicked { component: name },
        }
    }
    .boxed()
}
