//! Unit tests for sub-agent run models.

use agent_conductor::models::subagent::{
    summarize_task, NewRun, SubagentStatus, FALLBACK_LABEL, SUMMARY_MAX_CHARS,
};

#[test]
fn only_running_is_non_terminal() {
    assert!(!SubagentStatus::Running.is_terminal());
    for status in [
        SubagentStatus::Completed,
        SubagentStatus::Failed,
        SubagentStatus::TimedOut,
        SubagentStatus::Cancelled,
    ] {
        assert!(status.is_terminal(), "{status} should be terminal");
    }
}

#[test]
fn status_serializes_snake_case() {
    assert_eq!(serde_json::to_string(&SubagentStatus::TimedOut).unwrap(), "\"timed_out\"");
    assert_eq!(SubagentStatus::TimedOut.to_string(), "timed_out");
    let parsed: SubagentStatus = serde_json::from_str("\"cancelled\"").unwrap();
    assert_eq!(parsed, SubagentStatus::Cancelled);
}

#[test]
fn summary_is_first_line_of_trimmed_task() {
    assert_eq!(summarize_task("\n  Fix the build\nthen run tests"), "Fix the build");
    assert_eq!(summarize_task("   "), "");
}

#[test]
fn long_summary_is_truncated_with_ellipsis() {
    let task = "é".repeat(SUMMARY_MAX_CHARS + 20);
    let summary = summarize_task(&task);

    assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS + 1);
    assert!(summary.ends_with('…'));
}

#[test]
fn label_prefers_explicit_then_summary_then_fallback() {
    let explicit = NewRun::new("do it", "w1")
        .with_label("  Mine ")
        .into_run("sub_a".into());
    assert_eq!(explicit.label, "Mine");

    let derived = NewRun::new("do it\nsecond line", "w1")
        .with_label("   ")
        .into_run("sub_b".into());
    assert_eq!(derived.label, "do it");

    let fallback = NewRun::new("", "w1").into_run("sub_c".into());
    assert_eq!(fallback.label, FALLBACK_LABEL);
}

#[test]
fn new_run_starts_running_at_depth_one() {
    let run = NewRun::new("task", "w1")
        .with_parent("sub_parent")
        .with_model("m")
        .with_timeout_seconds(9)
        .into_run("sub_x".into());

    assert_eq!(run.status, SubagentStatus::Running);
    assert_eq!(run.spawn_depth, 1);
    assert_eq!(run.parent_run_id.as_deref(), Some("sub_parent"));
    assert_eq!(run.model_override.as_deref(), Some("m"));
    assert_eq!(run.run_timeout_seconds, Some(9));
    assert!(run.completed_at.is_none());
    assert!(run.result.is_empty());
    assert!(run.error.is_empty());
}

#[test]
fn listing_summary_truncates_long_fields() {
    let mut run = NewRun::new("t".repeat(500), "w1").into_run("sub_y".into());
    run.result = "r".repeat(5000);

    let summary = run.summary();

    assert_eq!(summary.task.chars().count(), 201);
    assert_eq!(summary.result.chars().count(), 2001);
    assert_eq!(summary.run_id, "sub_y");
}
