//! In-memory registry of sub-agent runs.
//!
//! Single source of truth for which runs exist, their status, hierarchy,
//! and cooperative cancellation flags. Spawning agents and independent
//! observers (status listings, kill commands) share nothing but an
//! `Arc<SubagentRegistry>`.
//!
//! Every mutation takes one internal lock, so each call is atomic with
//! respect to every other call. The cancellation-requested set sits behind
//! its own `RwLock` so that executors polling
//! [`is_cancel_requested`](SubagentRegistry::is_cancel_requested) only
//! ever take a shared read lock.
//!
//! Cancellation is advisory: [`cancel`](SubagentRegistry::cancel) flags
//! intent, flips a `Running` run to `Cancelled`, and fires the run's
//! [`CancellationToken`]. Stopping the work is up to the executor, so the
//! observed cancellation latency is bounded by how often it checks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::subagent::{NewRun, SubagentRun, SubagentStatus};
use crate::{AppError, Result};

/// Default number of terminal runs kept for listings.
pub const DEFAULT_MAX_RECENT_COMPLETED: usize = 100;

/// Error text stored by [`SubagentRegistry::fail`] when none is given.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Error text stored by [`SubagentRegistry::timeout`].
pub const TIMED_OUT_ERROR: &str = "Run timed out";

/// Counts and sample ids for diagnostics; contains no task text.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegistryDebugInfo {
    /// Runs currently stored, any status.
    pub total_runs: usize,
    /// Length of the completed-order FIFO.
    pub completed_order_len: usize,
    /// Runs still `Running`.
    pub running_count: usize,
    /// Up to five running run ids, oldest first.
    pub running_ids: Vec<String>,
    /// Up to the last ten ids of the completed-order FIFO.
    pub completed_order_tail: Vec<String>,
    /// Size of the cancellation-requested set.
    pub cancel_requested_count: usize,
}

struct Entry {
    seq: u64,
    run: SubagentRun,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    runs: HashMap<String, Entry>,
    completed_order: VecDeque<String>,
    next_seq: u64,
}

/// Registry of sub-agent runs for the process lifetime.
pub struct SubagentRegistry {
    state: Mutex<RegistryState>,
    cancel_requested: RwLock<HashSet<String>>,
    max_recent_completed: usize,
}

impl Default for SubagentRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECENT_COMPLETED)
    }
}

impl SubagentRegistry {
    /// Create an empty registry retaining up to `max_recent_completed`
    /// terminal runs.
    #[must_use]
    pub fn new(max_recent_completed: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            cancel_requested: RwLock::new(HashSet::new()),
            max_recent_completed,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_flags(&self) -> RwLockWriteGuard<'_, HashSet<String>> {
        self.cancel_requested
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new `Running` run and return its snapshot.
    pub fn register(&self, new_run: NewRun) -> SubagentRun {
        let mut state = self.lock_state();
        insert_run(&mut state, new_run)
    }

    /// Register a new run only if its parent (or, for top-level runs, its
    /// workspace) has fewer than `max_children` running children.
    ///
    /// The count and the insert happen under one lock, so concurrent
    /// callers cannot both take the last slot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Policy` when the limit is already reached.
    pub fn try_register(&self, new_run: NewRun, max_children: usize) -> Result<SubagentRun> {
        let mut state = self.lock_state();
        let active = count_children(
            &state,
            new_run.parent_run_id.as_deref(),
            &new_run.workspace_id,
        );
        if active >= max_children {
            return Err(AppError::Policy(format!(
                "max concurrent children reached ({active}/{max_children})"
            )));
        }
        Ok(insert_run(&mut state, new_run))
    }


    /// Snapshot of a run, if still retained.
    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<SubagentRun> {
        self.lock_state()
            .runs
            .get(run_id)
            .map(|entry| entry.run.clone())
    }

    /// Token fired by [`cancel`](Self::cancel) for this run.
    #[must_use]
    pub fn cancel_token(&self, run_id: &str) -> Option<CancellationToken> {
        self.lock_state()
            .runs
            .get(run_id)
            .map(|entry| entry.cancel.clone())
    }

    /// Mark a running run `Completed` with `result`. Unknown or already
    /// terminal ids are ignored.
    pub fn complete(&self, run_id: &str, result: &str) {
        self.finish(run_id, SubagentStatus::Completed, |run| {
            run.result = result.to_owned();
        });
    }

    /// Mark a running run `Failed`; an empty `error` is stored as
    /// [`UNKNOWN_ERROR`].
    pub fn fail(&self, run_id: &str, error: &str) {
        self.finish(run_id, SubagentStatus::Failed, |run| {
            run.error = if error.is_empty() {
                UNKNOWN_ERROR.to_owned()
            } else {
                error.to_owned()
            };
        });
    }

    /// Mark a running run `TimedOut`.
    pub fn timeout(&self, run_id: &str) {
        self.finish(run_id, SubagentStatus::TimedOut, |run| {
            run.error = TIMED_OUT_ERROR.to_owned();
        });
    }

    /// Request cancellation of a run.
    ///
    /// The id is always added to the cancellation-requested set, even for
    /// unknown or terminal runs. A `Running` run moves to `Cancelled` at
    /// once and its token fires.
    ///
    /// Flags for ids the registry no longer holds are pruned once they
    /// outnumber the retained runs by `max_recent_completed`, and whenever
    /// a terminal run is evicted.
    pub fn cancel(&self, run_id: &str) {
        let mut state = self.lock_state();
        {
            let mut flags = self.write_flags();
            flags.insert(run_id.to_owned());
            if flags.len() > state.runs.len() + self.max_recent_completed {
                flags.retain(|id| id == run_id || state.runs.contains_key(id));
                debug!(remaining = flags.len(), "pruned stale cancellation flags");
            }
        }

        let cancelled = self.finish_locked(&mut state, run_id, SubagentStatus::Cancelled, |_| {});
        if cancelled {
            info!(run_id, "sub-agent run cancelled");
        }
    }

    /// Whether cancellation was requested for `run_id`.
    #[must_use]
    pub fn is_cancel_requested(&self, run_id: &str) -> bool {
        self.cancel_requested
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(run_id)
    }

    /// Forget a previous cancellation request.
    pub fn clear_cancel_flag(&self, run_id: &str) {
        self.write_flags().remove(run_id);
    }

    /// Count running children of `parent_run_id`, or running top-level
    /// runs in `workspace_id` when no parent is given.
    #[must_use]
    pub fn count_active_children(&self, parent_run_id: Option<&str>, workspace_id: &str) -> usize {
        count_children(&self.lock_state(), parent_run_id, workspace_id)
    }

    /// Running runs, optionally limited to one workspace, oldest first.
    #[must_use]
    pub fn list_active(&self, workspace_id: Option<&str>) -> Vec<SubagentRun> {
        let state = self.lock_state();
        let mut active: Vec<&Entry> = state
            .runs
            .values()
            .filter(|entry| entry.run.is_running())
            .filter(|entry| workspace_id.is_none_or(|ws| entry.run.workspace_id == ws))
            .collect();
        active.sort_by_key(|entry| (entry.run.created_at, entry.seq));
        active.into_iter().map(|entry| entry.run.clone()).collect()
    }

    /// Terminal runs, most recently finished first, at most `limit`.
    #[must_use]
    pub fn list_recent_completed(&self, limit: usize, workspace_id: Option<&str>) -> Vec<SubagentRun> {
        let state = self.lock_state();
        state
            .completed_order
            .iter()
            .rev()
            .filter_map(|run_id| state.runs.get(run_id))
            .filter(|entry| entry.run.status.is_terminal())
            .filter(|entry| workspace_id.is_none_or(|ws| entry.run.workspace_id == ws))
            .take(limit)
            .map(|entry| entry.run.clone())
            .collect()
    }

    /// Counts and sample ids for diagnostics.
    #[must_use]
    pub fn get_debug_info(&self) -> RegistryDebugInfo {
        let cancel_requested_count = self
            .cancel_requested
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let state = self.lock_state();

        let mut running: Vec<&Entry> = state
            .runs
            .values()
            .filter(|entry| entry.run.is_running())
            .collect();
        running.sort_by_key(|entry| entry.seq);

        let tail_start = state.completed_order.len().saturating_sub(10);
        RegistryDebugInfo {
            total_runs: state.runs.len(),
            completed_order_len: state.completed_order.len(),
            running_count: running.len(),
            running_ids: running
                .iter()
                .take(5)
                .map(|entry| entry.run.run_id.clone())
                .collect(),
            completed_order_tail: state.completed_order.iter().skip(tail_start).cloned().collect(),
            cancel_requested_count,
        }
    }

    /// Apply a terminal transition if the run is still `Running`.
    ///
    /// Returns whether the transition happened. Terminal runs enter the
    /// completed-order FIFO exactly once, and the oldest terminal entry is
    /// evicted when the FIFO outgrows `max_recent_completed`.
    fn finish(
        &self,
        run_id: &str,
        status: SubagentStatus,
        apply: impl FnOnce(&mut SubagentRun),
    ) -> bool {
        let mut state = self.lock_state();
        self.finish_locked(&mut state, run_id, status, apply)
    }

    fn finish_locked(
        &self,
        state: &mut RegistryState,
        run_id: &str,
        status: SubagentStatus,
        apply: impl FnOnce(&mut SubagentRun),
    ) -> bool {
        let Some(entry) = state.runs.get_mut(run_id) else {
            return false;
        };
        if entry.run.status.is_terminal() {
            debug!(run_id, current = %entry.run.status, requested = %status, "run already terminal");
            return false;
        }

        entry.run.status = status;
        entry.run.completed_at = Some(Utc::now());
        apply(&mut entry.run);
        if status == SubagentStatus::Cancelled {
            entry.cancel.cancel();
        }

        state.completed_order.push_back(run_id.to_owned());
        debug!(
            run_id,
            %status,
            completed_order_len = state.completed_order.len(),
            "sub-agent run finished"
        );

        let mut evicted = false;
        while state.completed_order.len() > self.max_recent_completed {
            let Some(old_id) = state.completed_order.pop_front() else {
                break;
            };
            let evictable = state
                .runs
                .get(&old_id)
                .is_some_and(|old| old.run.status.is_terminal());
            if evictable {
                state.runs.remove(&old_id);
                evicted = true;
                debug!(run_id = %old_id, "evicted terminal sub-agent run");
            }
        }
        if evicted {
            self.write_flags().retain(|id| state.runs.contains_key(id));
        }
        true
    }
}

fn insert_run(state: &mut RegistryState, new_run: NewRun) -> SubagentRun {
    let run_id = loop {
        let candidate = generate_run_id();
        if !state.runs.contains_key(&candidate) {
            break candidate;
        }
    };

    let run = new_run.into_run(run_id.clone());
    let seq = state.next_seq;
    state.next_seq += 1;
    state.runs.insert(
        run_id.clone(),
        Entry {
            seq,
            run: run.clone(),
            cancel: CancellationToken::new(),
        },
    );

    debug!(
        run_id,
        workspace_id = %run.workspace_id,
        spawn_depth = run.spawn_depth,
        total_runs = state.runs.len(),
        "sub-agent run registered"
    );
    run
}

fn count_children(state: &RegistryState, parent_run_id: Option<&str>, workspace_id: &str) -> usize {
    state
        .runs
        .values()
        .filter(|entry| entry.run.is_running())
        .filter(|entry| match parent_run_id {
            Some(parent) => entry.run.parent_run_id.as_deref() == Some(parent),
            None => entry.run.parent_run_id.is_none() && entry.run.workspace_id == workspace_id,
        })
        .count()
}

fn generate_run_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("sub_{}", &hex[..12])
}
