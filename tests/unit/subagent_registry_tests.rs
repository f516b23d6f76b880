//! Unit tests for the sub-agent registry: lifecycle transitions,
//! retention eviction, cancellation flags, and listings.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};

use agent_conductor::models::subagent::{NewRun, SubagentStatus};
use agent_conductor::orchestrator::subagent_registry::{
    SubagentRegistry, TIMED_OUT_ERROR, UNKNOWN_ERROR,
};
use agent_conductor::AppError;

fn register(registry: &SubagentRegistry, ws: &str) -> String {
    registry.register(NewRun::new("task", ws)).run_id
}

#[test]
fn run_ids_are_prefixed_and_unique() {
    let registry = SubagentRegistry::default();
    let ids: HashSet<String> = (0..200).map(|_| register(&registry, "w1")).collect();

    assert_eq!(ids.len(), 200);
    for id in &ids {
        assert!(id.starts_with("sub_"));
        assert_eq!(id.len(), 16);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}

#[test]
fn terminal_transitions_set_payloads() {
    let registry = SubagentRegistry::default();
    let done = register(&registry, "w1");
    let failed = register(&registry, "w1");
    let blank = register(&registry, "w1");
    let slow = register(&registry, "w1");

    registry.complete(&done, "result");
    registry.fail(&failed, "bad input");
    registry.fail(&blank, "");
    registry.timeout(&slow);

    let done = registry.get(&done).unwrap();
    assert_eq!(done.status, SubagentStatus::Completed);
    assert_eq!(done.result, "result");
    assert!(done.completed_at.is_some());

    assert_eq!(registry.get(&failed).unwrap().error, "bad input");
    assert_eq!(registry.get(&blank).unwrap().error, UNKNOWN_ERROR);

    let slow = registry.get(&slow).unwrap();
    assert_eq!(slow.status, SubagentStatus::TimedOut);
    assert_eq!(slow.error, TIMED_OUT_ERROR);
}

#[test]
fn second_completion_is_ignored() {
    let registry = SubagentRegistry::default();
    let id = register(&registry, "w1");

    registry.complete(&id, "first");
    let completed_at = registry.get(&id).unwrap().completed_at;
    registry.complete(&id, "second");
    registry.fail(&id, "late");

    let run = registry.get(&id).unwrap();
    assert_eq!(run.status, SubagentStatus::Completed);
    assert_eq!(run.result, "first");
    assert!(run.error.is_empty());
    assert_eq!(run.completed_at, completed_at);
    assert_eq!(registry.get_debug_info().completed_order_len, 1);
}

#[test]
fn unknown_ids_are_ignored() {
    let registry = SubagentRegistry::default();

    registry.complete("sub_missing", "x");
    registry.fail("sub_missing", "x");
    registry.timeout("sub_missing");

    assert!(registry.get("sub_missing").is_none());
    assert_eq!(registry.get_debug_info().total_runs, 0);
}

#[test]
fn retention_evicts_oldest_terminal_runs_first() {
    let registry = SubagentRegistry::new(3);
    let ids: Vec<String> = (0..4).map(|_| register(&registry, "w1")).collect();
    for id in &ids {
        registry.complete(id, "ok");
    }

    assert!(registry.get(&ids[0]).is_none());
    for id in &ids[1..] {
        assert!(registry.get(id).is_some());
    }
    let info = registry.get_debug_info();
    assert_eq!(info.total_runs, 3);
    assert_eq!(info.completed_order_len, 3);
    assert_eq!(info.completed_order_tail, ids[1..].to_vec());
}

#[test]
fn running_runs_survive_eviction() {
    let registry = SubagentRegistry::new(2);
    let keeper = register(&registry, "w1");

    for _ in 0..10 {
        let id = register(&registry, "w1");
        registry.complete(&id, "ok");
    }

    let run = registry.get(&keeper).unwrap();
    assert_eq!(run.status, SubagentStatus::Running);
    assert_eq!(registry.get_debug_info().total_runs, 3);
}

#[test]
fn count_active_children_ignores_terminal_runs() {
    let registry = SubagentRegistry::default();
    let parent = register(&registry, "w1");
    let child = |ws: &str| {
        registry
            .register(NewRun::new("child", ws).with_parent(parent.clone()).with_depth(2))
            .run_id
    };
    let a = child("w1");
    let _b = child("w1");
    let c = child("w1");
    registry.complete(&a, "done");
    registry.cancel(&c);

    assert_eq!(registry.count_active_children(Some(parent.as_str()), "w1"), 1);
    assert_eq!(registry.count_active_children(Some("sub_other"), "w1"), 0);
    // Top-level counting covers parentless runs of the workspace only.
    assert_eq!(registry.count_active_children(None, "w1"), 1);
    assert_eq!(registry.count_active_children(None, "w2"), 0);
}

#[test]
fn cancel_running_run_marks_cancelled_and_fires_token() {
    let registry = SubagentRegistry::default();
    let id = register(&registry, "w1");
    let token = registry.cancel_token(&id).unwrap();

    registry.cancel(&id);

    assert_eq!(registry.get(&id).unwrap().status, SubagentStatus::Cancelled);
    assert!(registry.is_cancel_requested(&id));
    assert!(token.is_cancelled());
    assert!(registry.get(&id).unwrap().completed_at.is_some());
}

#[test]
fn cancel_completed_run_only_sets_flag() {
    let registry = SubagentRegistry::default();
    let id = register(&registry, "w1");
    registry.complete(&id, "done");

    registry.cancel(&id);

    let run = registry.get(&id).unwrap();
    assert_eq!(run.status, SubagentStatus::Completed);
    assert_eq!(run.result, "done");
    assert!(registry.is_cancel_requested(&id));
    assert_eq!(registry.get_debug_info().completed_order_len, 1);
}

#[test]
fn cancel_unknown_run_sets_flag_and_can_be_cleared() {
    let registry = SubagentRegistry::default();

    registry.cancel("sub_ghost");
    assert!(registry.is_cancel_requested("sub_ghost"));
    assert_eq!(registry.get_debug_info().cancel_requested_count, 1);

    registry.clear_cancel_flag("sub_ghost");
    assert!(!registry.is_cancel_requested("sub_ghost"));
}

#[test]
fn list_active_filters_by_workspace_in_creation_order() {
    let registry = SubagentRegistry::default();
    let w1: Vec<String> = (0..3).map(|_| register(&registry, "w1")).collect();
    let w2: Vec<String> = (0..2).map(|_| register(&registry, "w2")).collect();

    let listed: Vec<String> = registry
        .list_active(Some("w1"))
        .into_iter()
        .map(|run| run.run_id)
        .collect();
    assert_eq!(listed, w1);

    assert_eq!(registry.list_active(None).len(), 5);

    registry.complete(&w2[0], "ok");
    let remaining: Vec<String> = registry
        .list_active(Some("w2"))
        .into_iter()
        .map(|run| run.run_id)
        .collect();
    assert_eq!(remaining, vec![w2[1].clone()]);
}

#[test]
fn recent_completed_is_newest_first_and_filtered_before_limit() {
    let registry = SubagentRegistry::default();
    let a = register(&registry, "w1");
    let b = register(&registry, "w2");
    let c = register(&registry, "w1");
    let d = register(&registry, "w2");
    let running = register(&registry, "w1");
    for id in [&a, &b, &c, &d] {
        registry.complete(id, "ok");
    }

    let ids = |runs: Vec<agent_conductor::models::subagent::SubagentRun>| -> Vec<String> {
        runs.into_iter().map(|run| run.run_id).collect()
    };

    assert_eq!(ids(registry.list_recent_completed(10, None)), vec![d.clone(), c.clone(), b, a.clone()]);
    assert_eq!(ids(registry.list_recent_completed(2, Some("w1"))), vec![c, a]);
    assert_eq!(ids(registry.list_recent_completed(1, None)), vec![d]);
    assert!(!ids(registry.list_recent_completed(10, None)).contains(&running));
}

#[test]
fn debug_info_samples_running_ids() {
    let registry = SubagentRegistry::default();
    let ids: Vec<String> = (0..7).map(|_| register(&registry, "w1")).collect();
    registry.complete(&ids[6], "ok");

    let info = registry.get_debug_info();

    assert_eq!(info.total_runs, 7);
    assert_eq!(info.running_count, 6);
    assert_eq!(info.running_ids, ids[..5].to_vec());
    assert_eq!(info.completed_order_tail, vec![ids[6].clone()]);
    assert_eq!(info.cancel_requested_count, 0);
}

#[test]
fn concurrent_registration_and_completion() {
    let registry = Arc::new(SubagentRegistry::new(1000));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let id = registry.register(NewRun::new("t", "w1")).run_id;
                    registry.complete(&id, "ok");
                    registry.complete(&id, "again");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let info = registry.get_debug_info();
    assert_eq!(info.total_runs, 400);
    assert_eq!(info.completed_order_len, 400);
    assert_eq!(info.running_count, 0);
}

#[test]
fn cancellation_flags_follow_evicted_runs() {
    let registry = SubagentRegistry::new(2);

    for _ in 0..1000 {
        let id = register(&registry, "w1");
        registry.cancel(&id);
    }

    let info = registry.get_debug_info();
    assert_eq!(info.total_runs, 2);
    assert!(
        info.cancel_requested_count <= 2,
        "flags kept for evicted runs: {}",
        info.cancel_requested_count
    );
    for id in &info.completed_order_tail {
        assert!(registry.is_cancel_requested(id));
    }
}

#[test]
fn evicted_run_loses_its_flag() {
    let registry = SubagentRegistry::new(1);
    let first = register(&registry, "w1");
    registry.cancel(&first);
    assert!(registry.is_cancel_requested(&first));

    let second = register(&registry, "w1");
    registry.complete(&second, "ok");

    assert!(registry.get(&first).is_none());
    assert!(!registry.is_cancel_requested(&first));
}

#[test]
fn flags_for_unknown_ids_stay_bounded() {
    let registry = SubagentRegistry::new(2);
    let running = register(&registry, "w1");
    let done = register(&registry, "w1");
    registry.complete(&done, "ok");
    registry.cancel(&done);

    for n in 0..1000 {
        registry.cancel(&format!("sub_unknown{n}"));
    }

    let info = registry.get_debug_info();
    assert!(
        info.cancel_requested_count <= info.total_runs + 2 + 1,
        "unknown-id flags grew to {}",
        info.cancel_requested_count
    );
    assert!(registry.is_cancel_requested("sub_unknown999"));
    assert!(registry.is_cancel_requested(&done));
    assert_eq!(registry.get(&running).unwrap().status, SubagentStatus::Running);
}

#[test]
fn try_register_enforces_child_limit() {
    let registry = SubagentRegistry::default();

    registry.try_register(NewRun::new("a", "w1"), 2).unwrap();
    let second = registry.try_register(NewRun::new("b", "w1"), 2).unwrap();
    let err = registry.try_register(NewRun::new("c", "w1"), 2).unwrap_err();
    assert!(matches!(err, AppError::Policy(ref msg) if msg.contains("2/2")));

    registry.complete(&second.run_id, "done");
    assert!(registry.try_register(NewRun::new("d", "w1"), 2).is_ok());
    assert!(registry.try_register(NewRun::new("e", "w2"), 2).is_ok());
}

#[test]
fn concurrent_try_register_never_exceeds_limit() {
    for _ in 0..100 {
        let registry = Arc::new(SubagentRegistry::default());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.try_register(NewRun::new("t", "w1"), 1).is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 1);
        assert_eq!(registry.count_active_children(None, "w1"), 1);
    }
}
