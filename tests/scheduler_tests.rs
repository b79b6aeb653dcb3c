//! Scheduler integration tests
//!
//! Every test runs on a paused tokio clock, so timing assertions are exact.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use common::{Log, Recorder, busy_phase, idle_phase, recorder_tree, recording_phase};
use phasegraph::component::{Component, Hierarchy};
use phasegraph::config::TimeoutTable;
use phasegraph::dag::{
    COMMON_DOMAIN, GraphBuilder, NodeState, PhaseExecutor, PhaseGraph, SchedulerConfig,
    SchedulerEvent, TimeoutPolicy,
};
use phasegraph::errors::{ActionError, ScheduleError};
use phasegraph::phase::{ActionResult, PhaseContext, PhaseDefinition, PhaseKind, PhaseRegistry};

fn registry(definitions: Vec<PhaseDefinition>) -> PhaseRegistry {
    let mut registry = PhaseRegistry::new();
    for definition in definitions {
        registry.register(definition).unwrap();
    }
    registry
}

fn chain(registry: &PhaseRegistry, phases: &[&str]) -> PhaseGraph {
    let mut builder = GraphBuilder::new(registry);
    builder.add_chain(COMMON_DOMAIN, phases).unwrap();
    builder.build().unwrap()
}

fn quiet() -> SchedulerConfig {
    SchedulerConfig::default().with_global_timeout(Some(Duration::from_secs(10)))
}

// =============================================================================
// Objections
// =============================================================================

mod objections {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_task_phase_waits_for_every_objection() {
        let registry = registry(vec![busy_phase("main", Duration::from_millis(30))]);
        let graph = chain(&registry, &["main"]);
        let log = Arc::new(Log::default());
        let hierarchy = recorder_tree(&log);

        let report = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap();

        assert_eq!(
            report.entered_at("common.main", NodeState::ReadyToEnd),
            Some(Duration::from_millis(30))
        );
        assert_eq!(report.objection_misuse, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excess_drop_is_clamped_and_counted() {
        let registry = registry(vec![PhaseDefinition::task(
            "main",
            |_, ctx: PhaseContext| async move {
                ctx.raise_objections(2);
                tokio::time::sleep(Duration::from_millis(10)).await;
                ctx.drop_objections(3);
                assert_eq!(ctx.objection_count(), 0);
                Ok(())
            },
        )]);
        let graph = chain(&registry, &["main"]);
        let log = Arc::new(Log::default());
        let hierarchy = Hierarchy::new("tb", Arc::new(Recorder::new(&log))).unwrap();

        let report = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap();

        assert_eq!(report.objection_misuse, 1);
        assert_eq!(report.completed, vec!["common.main"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_function_phase_ignores_objections() {
        let registry = registry(vec![PhaseDefinition::top_down("build", |_, p| {
            p.raise_objection();
            Ok(())
        })]);
        let graph = chain(&registry, &["build"]);
        let log = Arc::new(Log::default());
        let hierarchy = recorder_tree(&log);

        let report = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap();

        assert_eq!(report.duration, Duration::ZERO);
        assert!(report.rearms.is_empty());
    }
}

// =============================================================================
// Ordering
// =============================================================================

mod ordering {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_successors_start_after_predecessors_end() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![
            recording_phase("a", PhaseKind::TopDown, &log),
            busy_phase("b", Duration::from_millis(20)),
            busy_phase("c", Duration::from_millis(5)),
            recording_phase("d", PhaseKind::BottomUp, &log),
        ]);
        let mut builder = GraphBuilder::new(&registry);
        let a = builder.add_node(COMMON_DOMAIN, "a").unwrap();
        let b = builder.add_node(COMMON_DOMAIN, "b").unwrap();
        let c = builder.add_node(COMMON_DOMAIN, "c").unwrap();
        let d = builder.add_node(COMMON_DOMAIN, "d").unwrap();
        builder.add_edge(a, b).unwrap();
        builder.add_edge(a, c).unwrap();
        builder.add_edge(b, d).unwrap();
        builder.add_edge(c, d).unwrap();
        let graph = builder.build().unwrap();
        let hierarchy = recorder_tree(&log);

        let report = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap();

        for node in graph.nodes() {
            let scheduled = report.position(&node.label(), NodeState::Scheduled).unwrap();
            for &pred in node.predecessors() {
                let ended = report.position(&graph.label(pred), NodeState::Ended).unwrap();
                assert!(ended < scheduled, "{} scheduled before {} ended", node.label(), graph.label(pred));
            }
        }
        // c and b run side by side; d waits for the slower one
        assert_eq!(
            report.entered_at("common.d", NodeState::Scheduled),
            Some(Duration::from_millis(20))
        );
        assert_eq!(report.completed.last().map(String::as_str), Some("common.d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_top_down_and_bottom_up_order() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![
            recording_phase("td", PhaseKind::TopDown, &log),
            recording_phase("bu", PhaseKind::BottomUp, &log),
        ]);
        let graph = chain(&registry, &["td", "bu"]);
        let hierarchy = recorder_tree(&log);

        PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap();

        assert_eq!(
            log.matching("exec:common.td:"),
            vec!["tb", "tb.env", "tb.env.agent", "tb.env.agent.driver", "tb.env.sb"]
        );
        assert_eq!(
            log.matching("exec:common.bu:"),
            vec!["tb.env.agent.driver", "tb.env.agent", "tb.env.sb", "tb.env", "tb"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_event_order_within_a_node() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![recording_phase("bu", PhaseKind::BottomUp, &log)]);
        let graph = chain(&registry, &["bu"]);
        let hierarchy = recorder_tree(&log);

        PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap();

        let started = log.matching("started:common.bu:");
        let mut ended = log.matching("ended:common.bu:");
        assert_eq!(started[0], "tb");
        ended.reverse();
        assert_eq!(started, ended);

        // Every component is started before anything executes, and every
        // ready-to-end query precedes the first ended hook
        let last_started = log.position("started:common.bu:tb.env.sb").unwrap();
        let first_exec = log.position("exec:common.bu:tb.env.agent.driver").unwrap();
        assert!(last_started < first_exec);
        let last_ready = log.position("ready:common.bu:tb").unwrap();
        let first_ended = log.position("ended:common.bu:tb.env.sb").unwrap();
        assert!(last_ready < first_ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_states_never_regress() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![
            recording_phase("build", PhaseKind::TopDown, &log),
            idle_phase("run"),
        ]);
        let graph = chain(&registry, &["build", "run"]);
        let hierarchy = recorder_tree(&log);

        let report = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap();

        for node in ["common.build", "common.run"] {
            assert_eq!(
                report.states_of(node),
                vec![
                    NodeState::Scheduled,
                    NodeState::Started,
                    NodeState::Executing,
                    NodeState::ReadyToEnd,
                    NodeState::Ended,
                    NodeState::Cleanup,
                    NodeState::Done,
                ]
            );
        }
    }
}

// =============================================================================
// Ready-to-end re-arm
// =============================================================================

mod rearm {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_objection_in_ready_to_end_rearms() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![idle_phase("main")]);
        let graph = chain(&registry, &["main"]);
        let hierarchy = Hierarchy::new(
            "tb",
            Arc::new(Recorder::rearming(&log, "main", Duration::from_millis(50))),
        )
        .unwrap();

        let report = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap();

        assert_eq!(report.rearms.get("common.main"), Some(&1));
        assert_eq!(
            report.states_of("common.main")[2..6],
            [
                NodeState::Executing,
                NodeState::ReadyToEnd,
                NodeState::Executing,
                NodeState::ReadyToEnd,
            ]
        );
        assert_eq!(log.matching("ready:common.main:").len(), 2);
        assert_eq!(
            report.entered_at("common.main", NodeState::Ended),
            Some(Duration::from_millis(50))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_limit_ends_phase() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![idle_phase("main")]);
        let graph = chain(&registry, &["main"]);
        let recorder = Recorder::rearming(&log, "main", Duration::from_millis(1)).always();
        let hierarchy = Hierarchy::new("tb", Arc::new(recorder)).unwrap();
        let config = quiet().with_max_ready_to_end_iterations(3);

        let report = PhaseExecutor::new(&graph, &hierarchy, config)
            .run()
            .await
            .unwrap();

        assert_eq!(report.rearms.get("common.main"), Some(&3));
        assert_eq!(log.matching("ready:common.main:").len(), 3);
        assert!(report.timeouts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_function_phase_is_not_rearmed() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![recording_phase("check", PhaseKind::BottomUp, &log)]);
        let graph = chain(&registry, &["check"]);
        let hierarchy = Hierarchy::new(
            "tb",
            Arc::new(Recorder::rearming(&log, "check", Duration::from_millis(50))),
        )
        .unwrap();

        let report = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap();

        assert!(report.rearms.is_empty());
        assert_eq!(log.matching("ready:common.check:").len(), 1);
    }
}

// =============================================================================
// Domains
// =============================================================================

mod domains {
    use super::*;

    fn two_domain_tree(log: &Arc<Log>) -> Hierarchy {
        let mut h = Hierarchy::new("tb", Arc::new(Recorder::new(log))).unwrap();
        let a = h.add_child(h.root(), "a_agent", Arc::new(Recorder::new(log))).unwrap();
        let b = h.add_child(h.root(), "b_agent", Arc::new(Recorder::new(log))).unwrap();
        h.set_domain(a, "A").unwrap();
        h.set_domain(b, "B").unwrap();
        h
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_successor_waits_for_slower_domain() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![
            busy_phase("a1", Duration::from_millis(10)),
            busy_phase("a2", Duration::from_millis(10)),
            busy_phase("b1", Duration::from_millis(10)),
            idle_phase("join"),
        ]);
        let mut builder = GraphBuilder::new(&registry);
        builder.add_chain("A", &["a1", "a2", "join"]).unwrap();
        builder.add_chain("B", &["b1", "join"]).unwrap();
        let graph = builder.build().unwrap();
        let hierarchy = two_domain_tree(&log);

        let report = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap();

        assert_eq!(
            report.entered_at("B.b1", NodeState::Ended),
            Some(Duration::from_millis(10))
        );
        let a_join = report.entered_at("A.join", NodeState::Scheduled).unwrap();
        let b_join = report.entered_at("B.join", NodeState::Scheduled).unwrap();
        assert_eq!(a_join, Duration::from_millis(20));
        assert_eq!(a_join, b_join);
        assert!(
            report.position("A.a2", NodeState::Ended).unwrap()
                < report.position("B.join", NodeState::Scheduled).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_components_only_see_their_domain() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![
            recording_phase("build", PhaseKind::TopDown, &log),
            recording_phase("cfg", PhaseKind::BottomUp, &log),
        ]);
        let mut builder = GraphBuilder::new(&registry);
        let build = builder.add_node(COMMON_DOMAIN, "build").unwrap();
        let cfg_a = builder.add_node("A", "cfg").unwrap();
        let cfg_b = builder.add_node("B", "cfg").unwrap();
        builder.add_edge(build, cfg_a).unwrap();
        builder.add_edge(build, cfg_b).unwrap();
        let graph = builder.build().unwrap();
        let hierarchy = two_domain_tree(&log);

        PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap();

        assert_eq!(log.matching("exec:common.build:").len(), 3);
        assert_eq!(log.matching("exec:A.cfg:"), vec!["tb.a_agent"]);
        assert_eq!(log.matching("exec:B.cfg:"), vec!["tb.b_agent"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_peers_end_together() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![busy_phase("main", Duration::from_millis(10))]);
        let mut builder = GraphBuilder::new(&registry);
        builder.add_node("A", "main").unwrap();
        builder.add_node("B", "main").unwrap();
        let graph = builder.build().unwrap();

        let mut h = Hierarchy::new("tb", Arc::new(Recorder::new(&log))).unwrap();
        let a = h.add_child(h.root(), "a_agent", Arc::new(Recorder::new(&log))).unwrap();
        let b = h
            .add_child(
                h.root(),
                "b_agent",
                Arc::new(Recorder::rearming(&log, "main", Duration::from_millis(40))),
            )
            .unwrap();
        h.set_domain(a, "A").unwrap();
        h.set_domain(b, "B").unwrap();

        let report = PhaseExecutor::new(&graph, &h, quiet()).run().await.unwrap();

        // B re-armed, so A had to wait with it
        assert_eq!(report.rearms.get("A.main"), Some(&1));
        assert_eq!(report.rearms.get("B.main"), Some(&1));
        assert_eq!(
            report.entered_at("A.main", NodeState::Ended),
            Some(Duration::from_millis(50))
        );
        assert_eq!(
            report.entered_at("B.main", NodeState::Ended),
            Some(Duration::from_millis(50))
        );
    }
}

// =============================================================================
// Timeouts
// =============================================================================

mod timeouts {
    use super::*;

    fn stalled_phase() -> PhaseDefinition {
        PhaseDefinition::task("stall", |_, ctx: PhaseContext| async move {
            ctx.raise_objection();
            std::future::pending::<()>().await;
            Ok(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_timeout_halts_run() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![stalled_phase(), idle_phase("after")]);
        let graph = chain(&registry, &["stall", "after"]);
        let hierarchy = recorder_tree(&log);
        let config = SchedulerConfig::default()
            .with_global_timeout(Some(Duration::from_millis(100)));

        let start = Instant::now();
        let err = PhaseExecutor::new(&graph, &hierarchy, config)
            .run()
            .await
            .unwrap_err();

        assert_eq!(start.elapsed(), Duration::from_millis(100));
        assert!(err.is_timeout());
        match err {
            ScheduleError::PhaseTimeout { phase, domain, bound } => {
                assert_eq!(phase, "stall");
                assert_eq!(domain, COMMON_DOMAIN);
                assert_eq!(bound, Duration::from_millis(100));
            }
            other => panic!("expected a timeout, got {other}"),
        }
        assert!(log.matching("started:common.after:").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_end_records_timeout_and_continues() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![stalled_phase(), idle_phase("after")]);
        let graph = chain(&registry, &["stall", "after"]);
        let hierarchy = recorder_tree(&log);
        let config = SchedulerConfig::default()
            .with_global_timeout(Some(Duration::from_millis(100)))
            .with_timeout_policy(TimeoutPolicy::ForceEnd);

        let report = PhaseExecutor::new(&graph, &hierarchy, config)
            .run()
            .await
            .unwrap();

        assert!(report.timed_out("common.stall"));
        let record = &report.timeouts[0];
        assert_eq!(record.bound, Duration::from_millis(100));
        assert_eq!(record.outstanding, 5);
        assert_eq!(
            report.entered_at("common.stall", NodeState::Ended),
            Some(Duration::from_millis(100))
        );
        // The ready-to-end query is skipped for a forced end
        assert!(log.matching("ready:common.stall:").is_empty());
        assert_eq!(report.completed, vec!["common.stall", "common.after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_phase_timeout_overrides_global() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![stalled_phase()]);
        let graph = chain(&registry, &["stall"]);
        let hierarchy = recorder_tree(&log);
        let mut table = TimeoutTable::new();
        table.insert("tb.stall", 40);
        let config = SchedulerConfig::default()
            .with_global_timeout(Some(Duration::from_secs(5)))
            .with_timeout_policy(TimeoutPolicy::ForceEnd);

        let report = PhaseExecutor::new(&graph, &hierarchy, config)
            .with_timeouts(&table)
            .run()
            .await
            .unwrap();

        assert_eq!(report.timeouts[0].bound, Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_domain_suffixed_timeout_bounds_one_domain() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![stalled_phase()]);
        let mut builder = GraphBuilder::new(&registry);
        builder.add_chain("A", &["stall"]).unwrap();
        builder.add_chain("B", &["stall"]).unwrap();
        let graph = builder.build().unwrap();
        let mut hierarchy = Hierarchy::new("tb", Arc::new(Recorder::new(&log))).unwrap();
        let a = hierarchy
            .add_child(hierarchy.root(), "a_agent", Arc::new(Recorder::new(&log)))
            .unwrap();
        let b = hierarchy
            .add_child(hierarchy.root(), "b_agent", Arc::new(Recorder::new(&log)))
            .unwrap();
        hierarchy.set_domain(a, "A").unwrap();
        hierarchy.set_domain(b, "B").unwrap();
        let mut table = TimeoutTable::new();
        table.insert("tb.stall", 60);
        table.insert("tb.stall@A", 30);
        let config = SchedulerConfig::default()
            .with_global_timeout(Some(Duration::from_secs(5)))
            .with_timeout_policy(TimeoutPolicy::ForceEnd);

        let report = PhaseExecutor::new(&graph, &hierarchy, config)
            .with_timeouts(&table)
            .run()
            .await
            .unwrap();

        let bound = |node: &str| {
            report
                .timeouts
                .iter()
                .find(|t| t.node == node)
                .map(|t| t.bound)
        };
        assert_eq!(bound("A.stall"), Some(Duration::from_millis(30)));
        assert_eq!(bound("B.stall"), Some(Duration::from_millis(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_positive_phase_timeout_falls_back_to_global() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![stalled_phase()]);
        let graph = chain(&registry, &["stall"]);
        let hierarchy = recorder_tree(&log);
        let mut table = TimeoutTable::new();
        table.insert("tb.*", 0);
        let config = SchedulerConfig::default()
            .with_global_timeout(Some(Duration::from_millis(70)))
            .with_timeout_policy(TimeoutPolicy::ForceEnd);

        let report = PhaseExecutor::new(&graph, &hierarchy, config)
            .with_timeouts(&table)
            .run()
            .await
            .unwrap();

        assert_eq!(report.timeouts[0].bound, Duration::from_millis(70));
    }
}

// =============================================================================
// Cancellation
// =============================================================================

mod cancellation {
    use super::*;

    struct Ticker {
        ticks: Arc<AtomicU32>,
        at_end: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Component for Ticker {
        async fn run_phase(&self, _phase: &PhaseContext) -> ActionResult {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.ticks.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn phase_ended(&self, phase: &PhaseContext) {
            if phase.phase_name() == "run" {
                self.at_end
                    .store(self.ticks.load(Ordering::SeqCst), Ordering::SeqCst);
            }
        }
    }

    struct Holder;

    #[async_trait]
    impl Component for Holder {
        async fn main_phase(&self, phase: &PhaseContext) -> ActionResult {
            phase.raise_objection();
            tokio::time::sleep(Duration::from_millis(55)).await;
            phase.drop_objection();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_activities_stop_once_phase_ended() {
        let ticks = Arc::new(AtomicU32::new(0));
        let at_end = Arc::new(AtomicU32::new(u32::MAX));
        let mut hierarchy = Hierarchy::new("tb", Arc::new(Holder)).unwrap();
        hierarchy
            .add_child(
                hierarchy.root(),
                "ticker",
                Arc::new(Ticker {
                    ticks: ticks.clone(),
                    at_end: at_end.clone(),
                }),
            )
            .unwrap();
        let registry = PhaseRegistry::standard();
        let graph = GraphBuilder::standard(&registry).unwrap();

        let report = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap();

        // run stays open while the runtime domain is busy in main
        let run_ended = report.entered_at("common.run", NodeState::Ended).unwrap();
        assert!(run_ended >= Duration::from_millis(55));
        let counted = at_end.load(Ordering::SeqCst);
        assert!(counted >= 5, "ticker only ticked {counted} times");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), counted);
    }
}

// =============================================================================
// Failures
// =============================================================================

mod failures {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_function_action_failure_reports_context() {
        let registry = registry(vec![PhaseDefinition::bottom_up("check", |_, p| {
            if p.component() == "tb.env" {
                return Err(ActionError::msg("mismatch"));
            }
            Ok(())
        })]);
        let graph = chain(&registry, &["check"]);
        let log = Arc::new(Log::default());
        let hierarchy = recorder_tree(&log);

        let err = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap_err();

        match err {
            ScheduleError::ActionFailed {
                phase,
                domain,
                state,
                component,
                ..
            } => {
                assert_eq!(phase, "check");
                assert_eq!(domain, COMMON_DOMAIN);
                assert_eq!(state, NodeState::Executing);
                assert_eq!(component, "tb.env");
            }
            other => panic!("expected an action failure, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_action_failure_halts_run() {
        let registry = registry(vec![PhaseDefinition::task(
            "main",
            |_, ctx: PhaseContext| async move {
                ctx.raise_objection();
                tokio::time::sleep(Duration::from_millis(5)).await;
                if ctx.component() == "tb.env.sb" {
                    return Err(ActionError::msg("bad response"));
                }
                ctx.drop_objection();
                Ok(())
            },
        )]);
        let graph = chain(&registry, &["main"]);
        let log = Arc::new(Log::default());
        let hierarchy = recorder_tree(&log);

        let err = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ScheduleError::ActionFailed { ref component, .. } if component == "tb.env.sb"
        ));
        assert!(err.to_string().contains("bad response"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_while_waiting_on_sibling_halts_run() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![
            PhaseDefinition::task("watch", |_, ctx: PhaseContext| async move {
                if ctx.component() == "tb.env.sb" {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    return Err(ActionError::msg("monitor crashed"));
                }
                Ok(())
            }),
            busy_phase("main", Duration::from_millis(500)),
            idle_phase("after"),
        ]);
        let mut builder = GraphBuilder::new(&registry);
        let watch = builder.add_node(COMMON_DOMAIN, "watch").unwrap();
        let main = builder.add_node(COMMON_DOMAIN, "main").unwrap();
        let after = builder.add_node(COMMON_DOMAIN, "after").unwrap();
        builder.add_edge(watch, after).unwrap();
        builder.add_edge(main, after).unwrap();
        let graph = builder.build().unwrap();
        let hierarchy = recorder_tree(&log);

        let start = Instant::now();
        let err = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap_err();

        // watch drained at once and was only waiting on main
        assert_eq!(start.elapsed(), Duration::from_millis(20));
        assert!(matches!(
            err,
            ScheduleError::ActionFailed { ref phase, ref component, .. }
                if phase == "watch" && component == "tb.env.sb"
        ));
        assert!(log.matching("ended:common.main:").is_empty());
        assert!(log.matching("started:common.after:").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_panic_is_reported() {
        let registry = registry(vec![PhaseDefinition::task(
            "main",
            |_, ctx: PhaseContext| async move {
                ctx.raise_objection();
                if ctx.component() == "tb" {
                    panic!("driver exploded");
                }
                ctx.drop_objection();
                Ok(())
            },
        )]);
        let graph = chain(&registry, &["main"]);
        let log = Arc::new(Log::default());
        let hierarchy = recorder_tree(&log);

        let err = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, ScheduleError::TaskPanicked { ref component, .. } if component == "tb"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_action_is_fatal() {
        let registry = registry(vec![PhaseDefinition::new("bare", PhaseKind::TopDown)]);
        let graph = chain(&registry, &["bare"]);
        let log = Arc::new(Log::default());
        let hierarchy = recorder_tree(&log);

        let err = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, ScheduleError::MissingAction { ref phase, .. } if phase == "bare"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_kind_mismatch_is_fatal() {
        let registry = registry(vec![
            PhaseDefinition::new("odd", PhaseKind::Task)
                .with_action(phasegraph::phase::PhaseAction::function(|_, _| Ok(()))),
        ]);
        let graph = chain(&registry, &["odd"]);
        let log = Arc::new(Log::default());
        let hierarchy = recorder_tree(&log);

        let err = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, ScheduleError::ActionKindMismatch { .. }));
    }
}

// =============================================================================
// Events
// =============================================================================

mod events {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_event_channel_mirrors_report() {
        let log = Arc::new(Log::default());
        let registry = registry(vec![
            recording_phase("build", PhaseKind::TopDown, &log),
            busy_phase("run", Duration::from_millis(10)),
        ]);
        let graph = chain(&registry, &["build", "run"]);
        let hierarchy = recorder_tree(&log);

        let (tx, mut rx) = mpsc::channel(1024);
        let report = PhaseExecutor::new(&graph, &hierarchy, quiet())
            .with_event_channel(tx)
            .run()
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        let transitions = events
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::Transition { .. }))
            .count();
        assert_eq!(transitions, report.transitions.len());
        assert!(matches!(
            events.first(),
            Some(SchedulerEvent::Transition { node, to: NodeState::Scheduled, .. }) if node == "common.build"
        ));
        assert!(matches!(
            events.last(),
            Some(SchedulerEvent::RunCompleted { nodes: 2, .. })
        ));
    }
}
