//! Phase executor: drives every node of a graph through its state machine.
//!
//! One scheduler task owns all node state. Task-phase nodes hand their
//! activity `JoinSet` to a wait future that resolves once the node drains
//! (every activity polled once and the objection count at zero), times out,
//! or sees an activity fail. Those futures are driven by a
//! `FuturesUnordered`. A drained node keeps its set in its runtime, where
//! the loop still watches it for failures until the node ends. Everything
//! else happens inline in the loop.

use crate::component::Hierarchy;
use crate::config::TimeoutSource;
use crate::dag::builder::{NodeId, PhaseGraph};
use crate::dag::scheduler::{PhaseScheduler, SchedulerConfig, TimeoutPolicy};
use crate::dag::state::{ExecutionTimer, NodeState, RunReport, TimeoutRecord, Transition};
use crate::errors::{ActionError, GraphError, ScheduleError};
use crate::objection::Objection;
use crate::traverse::{ActivityOutcome, PendingActivities, Traversal};
use futures::StreamExt;
use futures::future::{BoxFuture, poll_fn};
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A node changed state.
    Transition {
        node: String,
        from: NodeState,
        to: NodeState,
        at_ms: u64,
    },
    /// An objection raised during the ready-to-end query sent a node back to executing.
    Rearmed { node: String, iteration: u32 },
    /// A task phase outlived its timeout.
    Timeout {
        node: String,
        bound_ms: u64,
        outstanding: u32,
    },
    /// Every node reached done.
    RunCompleted { nodes: usize, duration_ms: u64 },
}

/// Why a node's wait future resolved.
enum Drain {
    Idle,
    TimedOut,
    Failed { component: String, error: ActionError },
    Panicked { component: String },
}

struct NodeWait {
    id: NodeId,
    tasks: JoinSet<ActivityOutcome>,
    drain: Drain,
}

/// Run-time state of one node.
struct NodeRuntime {
    objection: Arc<Objection>,
    /// `None` while a wait future owns the set
    tasks: Option<JoinSet<ActivityOutcome>>,
    pending: Arc<PendingActivities>,
    deadline: Option<Instant>,
    bound: Option<Duration>,
    rearms: u32,
    timed_out: bool,
}

impl NodeRuntime {
    fn new(label: String) -> Self {
        Self {
            objection: Arc::new(Objection::new(label)),
            tasks: None,
            pending: Arc::new(PendingActivities::new()),
            deadline: None,
            bound: None,
            rearms: 0,
            timed_out: false,
        }
    }
}

/// Everything mutated during one run.
struct RunState<'g> {
    scheduler: PhaseScheduler<'g>,
    runtimes: Vec<NodeRuntime>,
    report: RunReport,
    timer: ExecutionTimer,
    waiting: FuturesUnordered<BoxFuture<'static, NodeWait>>,
}

/// Drives a [`PhaseGraph`] over a [`Hierarchy`].
///
/// Both are borrowed immutably for the whole run, so neither can be
/// restructured while phases execute.
pub struct PhaseExecutor<'a> {
    graph: &'a PhaseGraph,
    hierarchy: &'a Hierarchy,
    config: SchedulerConfig,
    timeouts: Option<&'a dyn TimeoutSource>,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl<'a> PhaseExecutor<'a> {
    /// Create a new executor.
    pub fn new(graph: &'a PhaseGraph, hierarchy: &'a Hierarchy, config: SchedulerConfig) -> Self {
        Self {
            graph,
            hierarchy,
            config,
            timeouts: None,
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Set the per-phase timeout lookup.
    pub fn with_timeouts(mut self, timeouts: &'a dyn TimeoutSource) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run every node to `Done`.
    ///
    /// Any error is fatal: the run stops, every outstanding activity is
    /// aborted and the error is returned.
    pub async fn run(&self) -> Result<RunReport, ScheduleError> {
        let mut run = RunState {
            scheduler: PhaseScheduler::new(self.graph),
            runtimes: self
                .graph
                .nodes()
                .iter()
                .map(|n| NodeRuntime::new(n.label()))
                .collect(),
            report: RunReport::new(),
            timer: ExecutionTimer::start(),
            waiting: FuturesUnordered::new(),
        };

        info!(
            nodes = self.graph.len(),
            components = self.hierarchy.len(),
            "starting phase run"
        );

        match self.drive(&mut run).await {
            Ok(()) => {
                run.report.duration = run.timer.elapsed();
                self.emit_event(SchedulerEvent::RunCompleted {
                    nodes: self.graph.len(),
                    duration_ms: run.report.duration.as_millis() as u64,
                })
                .await;
                info!(
                    duration_ms = run.report.duration.as_millis() as u64,
                    timeouts = run.report.timeouts.len(),
                    "phase run completed"
                );
                Ok(run.report)
            }
            Err(e) => {
                error!(error = %e, "phase run halted");
                run.waiting.clear();
                for rt in &mut run.runtimes {
                    if let Some(tasks) = rt.tasks.as_mut() {
                        tasks.abort_all();
                    }
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, run: &mut RunState<'a>) -> Result<(), ScheduleError> {
        loop {
            loop {
                let ready = run.scheduler.ready_nodes();
                let groups = run.scheduler.drained_groups();
                if ready.is_empty() && groups.is_empty() {
                    break;
                }
                for &id in &ready {
                    self.advance(run, id, NodeState::Scheduled).await?;
                }
                for id in ready {
                    self.start_node(run, id).await?;
                }
                for group in groups {
                    self.settle_group(run, &group).await?;
                }
            }

            if run.scheduler.is_complete() {
                return Ok(());
            }

            let wait = tokio::select! {
                biased;
                (id, drain) = watch_drained(&mut run.runtimes) => {
                    let tasks = run.runtimes[id].tasks.take().unwrap_or_default();
                    Some(NodeWait { id, tasks, drain })
                }
                wait = run.waiting.next() => wait,
            };
            let Some(wait) = wait else {
                return Err(GraphError::Cycle(run.scheduler.unfinished()).into());
            };
            self.handle_wait(run, wait).await?;
        }
    }

    /// Scheduled -> Started -> Executing.
    async fn start_node(&self, run: &mut RunState<'a>, id: NodeId) -> Result<(), ScheduleError> {
        let node = &self.graph.nodes()[id];
        let traversal = self.traversal(run, id);

        traversal.started()?;
        self.advance(run, id, NodeState::Started).await?;

        let mut tasks = JoinSet::new();
        let pending = run.runtimes[id].pending.clone();
        traversal.execute(&mut tasks, &pending)?;
        self.advance(run, id, NodeState::Executing).await?;

        if node.definition().is_task() {
            let bound = self.effective_timeout(node.domain(), node.name());
            let rt = &mut run.runtimes[id];
            rt.bound = bound;
            rt.deadline = bound.map(|b| Instant::now() + b);
            debug!(node = %node.label(), activities = tasks.len(), ?bound, "task phase spawned");
            self.wait_for(run, id, tasks);
        } else {
            run.scheduler.mark_drained(id);
        }
        Ok(())
    }

    fn wait_for(&self, run: &mut RunState<'a>, id: NodeId, tasks: JoinSet<ActivityOutcome>) {
        let rt = &run.runtimes[id];
        run.waiting.push(Box::pin(wait_for_drain(
            id,
            tasks,
            rt.pending.clone(),
            rt.objection.clone(),
            rt.deadline,
        )));
    }

    async fn handle_wait(&self, run: &mut RunState<'a>, wait: NodeWait) -> Result<(), ScheduleError> {
        let NodeWait { id, tasks, drain } = wait;
        let node = &self.graph.nodes()[id];
        run.runtimes[id].tasks = Some(tasks);

        match drain {
            Drain::Idle => {
                debug!(node = %node.label(), "objections dropped");
                run.scheduler.mark_drained(id);
            }
            Drain::TimedOut => {
                let rt = &mut run.runtimes[id];
                let bound = rt.bound.unwrap_or_default();
                let outstanding = rt.objection.count();
                if self.config.timeout_policy == TimeoutPolicy::Fatal {
                    return Err(ScheduleError::PhaseTimeout {
                        phase: node.name().to_string(),
                        domain: node.domain().to_string(),
                        bound,
                    });
                }
                warn!(
                    node = %node.label(),
                    bound_ms = bound.as_millis() as u64,
                    outstanding,
                    "phase timeout, forcing end"
                );
                rt.timed_out = true;
                run.report.timeouts.push(TimeoutRecord {
                    node: node.label(),
                    bound,
                    outstanding,
                });
                run.scheduler.mark_drained(id);
                self.emit_event(SchedulerEvent::Timeout {
                    node: node.label(),
                    bound_ms: bound.as_millis() as u64,
                    outstanding,
                })
                .await;
            }
            Drain::Failed { component, error } => {
                return Err(ScheduleError::ActionFailed {
                    phase: node.name().to_string(),
                    domain: node.domain().to_string(),
                    state: run.scheduler.state(id),
                    component,
                    source: error,
                });
            }
            Drain::Panicked { component } => {
                return Err(ScheduleError::TaskPanicked {
                    phase: node.name().to_string(),
                    domain: node.domain().to_string(),
                    component,
                });
            }
        }
        Ok(())
    }

    /// Every member of a sync group drained: query ready-to-end, then either
    /// re-arm the whole group or end it.
    async fn settle_group(&self, run: &mut RunState<'a>, group: &[NodeId]) -> Result<(), ScheduleError> {
        let forced = group.iter().any(|&id| run.runtimes[id].timed_out);
        let exhausted = group
            .iter()
            .any(|&id| run.runtimes[id].rearms >= self.config.max_ready_to_end_iterations);

        for &id in group {
            self.advance(run, id, NodeState::ReadyToEnd).await?;
        }

        if !forced && !exhausted {
            for &id in group {
                self.traversal(run, id).ready_to_end();
            }

            let is_task = self.graph.nodes()[group[0]].definition().is_task();
            let raised = group.iter().any(|&id| run.runtimes[id].objection.count() > 0);
            if is_task && raised {
                for &id in group {
                    self.rearm(run, id).await?;
                }
                return Ok(());
            }
        } else if exhausted && !forced {
            warn!(
                nodes = ?group.iter().map(|&id| self.graph.label(id)).collect::<Vec<_>>(),
                max = self.config.max_ready_to_end_iterations,
                "ready-to-end re-arm limit reached, ending phase"
            );
        }

        for &id in group {
            self.end_node(run, id).await?;
        }
        Ok(())
    }

    async fn rearm(&self, run: &mut RunState<'a>, id: NodeId) -> Result<(), ScheduleError> {
        self.advance(run, id, NodeState::Executing).await?;
        let label = self.graph.label(id);
        let rt = &mut run.runtimes[id];
        rt.rearms += 1;
        let iteration = rt.rearms;
        *run.report.rearms.entry(label.clone()).or_insert(0) += 1;
        debug!(node = %label, iteration, "objection raised during ready-to-end, re-arming");
        self.emit_event(SchedulerEvent::Rearmed {
            node: label,
            iteration,
        })
        .await;

        let tasks = run.runtimes[id].tasks.take().unwrap_or_default();
        self.wait_for(run, id, tasks);
        Ok(())
    }

    /// ReadyToEnd -> Ended -> Cleanup -> Done.
    async fn end_node(&self, run: &mut RunState<'a>, id: NodeId) -> Result<(), ScheduleError> {
        let node = &self.graph.nodes()[id];
        self.advance(run, id, NodeState::Ended).await?;

        if let Some(mut tasks) = run.runtimes[id].tasks.take() {
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(ActivityOutcome::Failed { component, error }) => {
                        return Err(ScheduleError::ActionFailed {
                            phase: node.name().to_string(),
                            domain: node.domain().to_string(),
                            state: NodeState::Executing,
                            component,
                            source: error,
                        });
                    }
                    Ok(ActivityOutcome::Panicked { component }) => {
                        return Err(ScheduleError::TaskPanicked {
                            phase: node.name().to_string(),
                            domain: node.domain().to_string(),
                            component,
                        });
                    }
                    Ok(ActivityOutcome::Returned { .. }) | Err(_) => {}
                }
            }
        }

        self.traversal(run, id).ended();

        self.advance(run, id, NodeState::Cleanup).await?;
        let rt = &mut run.runtimes[id];
        let outstanding = rt.objection.clear();
        if outstanding > 0 {
            debug!(node = %node.label(), outstanding, "cleared outstanding objections");
        }
        run.report.objection_misuse += rt.objection.misuse_count();
        rt.deadline = None;

        self.advance(run, id, NodeState::Done).await?;
        run.report.completed.push(node.label());
        Ok(())
    }

    /// Apply a transition, record it and publish it.
    async fn advance(&self, run: &mut RunState<'a>, id: NodeId, to: NodeState) -> Result<(), ScheduleError> {
        let from = run.scheduler.transition(id, to)?;
        let at = run.timer.elapsed();
        let node = self.graph.label(id);

        if self.config.phase_trace {
            info!(target: "phase_trace", node = %node, %from, %to, "phase transition");
        } else {
            debug!(node = %node, %from, %to, "phase transition");
        }

        run.report.transitions.push(Transition {
            node: node.clone(),
            from,
            to,
            at,
        });
        self.emit_event(SchedulerEvent::Transition {
            node,
            from,
            to,
            at_ms: at.as_millis() as u64,
        })
        .await;
        Ok(())
    }

    fn traversal(&self, run: &RunState<'a>, id: NodeId) -> Traversal<'a> {
        let node = &self.graph.nodes()[id];
        Traversal::new(
            self.hierarchy,
            node.definition(),
            node.domain(),
            run.runtimes[id].objection.clone(),
            self.config.phase_trace,
        )
    }

    /// Per-phase timeout scoped to the hierarchy root, else the global one.
    fn effective_timeout(&self, domain: &str, phase: &str) -> Option<Duration> {
        let scope = self.hierarchy.full_name(self.hierarchy.root());
        self.timeouts
            .and_then(|t| t.domain_phase_timeout(scope, domain, phase))
            .or(self.config.global_timeout)
    }

    /// Emit an event to the event channel if configured.
    async fn emit_event(&self, event: SchedulerEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

/// Resolve once the node drains, times out, or an activity fails.
async fn wait_for_drain(
    id: NodeId,
    mut tasks: JoinSet<ActivityOutcome>,
    pending: Arc<PendingActivities>,
    objection: Arc<Objection>,
    deadline: Option<Instant>,
) -> NodeWait {
    let drain = loop {
        tokio::select! {
            biased;
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                Ok(ActivityOutcome::Failed { component, error }) => break Drain::Failed { component, error },
                Ok(ActivityOutcome::Panicked { component }) => break Drain::Panicked { component },
                Ok(ActivityOutcome::Returned { .. }) | Err(_) => continue,
            },
            _ = drained(&pending, &objection) => break Drain::Idle,
            _ = deadline_elapsed(deadline) => break Drain::TimedOut,
        }
    };
    NodeWait { id, tasks, drain }
}

/// Resolve when an activity of a drained node fails or panics.
///
/// A drained node holds its `JoinSet` until it ends, which may be long
/// after draining when it waits on siblings.
fn watch_drained(runtimes: &mut [NodeRuntime]) -> impl Future<Output = (NodeId, Drain)> + '_ {
    poll_fn(move |cx| {
        for (id, rt) in runtimes.iter_mut().enumerate() {
            let Some(tasks) = rt.tasks.as_mut() else {
                continue;
            };
            while let Poll::Ready(Some(joined)) = tasks.poll_join_next(cx) {
                match joined {
                    Ok(ActivityOutcome::Failed { component, error }) => {
                        return Poll::Ready((id, Drain::Failed { component, error }));
                    }
                    Ok(ActivityOutcome::Panicked { component }) => {
                        return Poll::Ready((id, Drain::Panicked { component }));
                    }
                    Ok(ActivityOutcome::Returned { .. }) | Err(_) => {}
                }
            }
        }
        Poll::Pending
    })
}

async fn drained(pending: &PendingActivities, objection: &Objection) {
    pending.wait_for_zero().await;
    objection.wait_for_zero().await;
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
