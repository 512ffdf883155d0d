//! Task selection.
//!
//! The scheduler is a pure function over an immutable snapshot of the
//! task list: it decides which tasks to reserve (UP_NEXT), which reserved
//! tasks to start (IN_PROGRESS), and which reservations to revoke. The
//! orchestrator enacts the plan afterwards, outside the store lock, so
//! decisions stay cheap.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use sm_core::config::OrchestratorConfig;
use sm_core::types::{Task, TaskStatus};

/// Cap on the anti-starvation boost so priority inversion stays bounded.
const MAX_STARVATION_BOOST: i64 = 10;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent: u32,
    /// UP_NEXT reservation depth.
    pub lookahead: u32,
    pub starvation_ttl: Duration,
}

impl From<&OrchestratorConfig> for SchedulerSettings {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            max_concurrent: cfg.max_concurrent_agents,
            lookahead: cfg.lookahead(),
            starvation_ttl: cfg.starvation_ttl(),
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulePlan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemotionReason {
    DependencyInvalid,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulePlan {
    /// UNCLAIMED tasks to reserve as UP_NEXT, in selection order.
    pub promote: Vec<String>,
    /// UP_NEXT tasks to start now (spawn), in selection order.
    pub start: Vec<String>,
    /// UP_NEXT tasks whose reservation is no longer valid.
    pub demote: Vec<(String, DemotionReason)>,
}

impl SchedulePlan {
    pub fn is_empty(&self) -> bool {
        self.promote.is_empty() && self.start.is_empty() && self.demote.is_empty()
    }
}

// ---------------------------------------------------------------------------
// plan()
// ---------------------------------------------------------------------------

/// Compute the next scheduling step.
///
/// Eligibility for a reservation: the task is UNCLAIMED and not blocked,
/// every dependency is at least COMPLETED, and its exclusive files do not
/// overlap the touched files of anything already IN_PROGRESS, UP_NEXT, or
/// selected earlier in this same plan (in either direction).
pub fn plan(tasks: &[Task], settings: &SchedulerSettings, now: DateTime<Utc>) -> SchedulePlan {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let deps_satisfied = |t: &Task| {
        t.dependencies
            .iter()
            .all(|d| by_id.get(d.as_str()).is_some_and(|d| d.status.satisfies_dependency()))
    };

    let mut plan = SchedulePlan::default();

    // 1. Revoke reservations whose dependencies became invalid (deleted,
    //    reset, or rewritten).
    let mut demoted: HashSet<&str> = HashSet::new();
    for task in tasks.iter().filter(|t| t.status == TaskStatus::UpNext) {
        if !deps_satisfied(task) {
            demoted.insert(task.id.as_str());
            plan.demote
                .push((task.id.clone(), DemotionReason::DependencyInvalid));
        }
    }

    let in_progress: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .collect();
    let mut up_next: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::UpNext && !demoted.contains(t.id.as_str()))
        .collect();
    sort_by_selection_order(&mut up_next, settings, now);

    // 2. Start reserved tasks while the concurrency budget allows.
    let mut running = in_progress.len();
    for task in &up_next {
        if running >= settings.max_concurrent as usize {
            break;
        }
        plan.start.push(task.id.clone());
        running += 1;
    }
    let started: HashSet<&str> = plan.start.iter().map(|s| s.as_str()).collect();

    // 3. Fill the reservation lookahead from eligible UNCLAIMED tasks.
    //    File-ownership is accounted for here, at reservation time.
    let mut occupied: Vec<&Task> = Vec::new();
    occupied.extend(&in_progress);
    occupied.extend(&up_next);

    let mut reservations = up_next.len() - started.len();

    let mut candidates: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Unclaimed && !t.blocked)
        .filter(|t| deps_satisfied(t))
        .collect();
    sort_by_selection_order(&mut candidates, settings, now);

    for task in candidates {
        if reservations >= settings.lookahead as usize && running >= settings.max_concurrent as usize
        {
            break;
        }
        if occupied.iter().any(|o| task.files_conflict_with(o)) {
            debug!(task_id = %task.id, "skipped: declared files overlap running work");
            continue;
        }
        plan.promote.push(task.id.clone());
        occupied.push(task);
        // A fresh reservation starts in the same pass when the budget has
        // room (UNCLAIMED -> UP_NEXT -> IN_PROGRESS within one tick).
        if running < settings.max_concurrent as usize {
            plan.start.push(task.id.clone());
            running += 1;
        } else {
            reservations += 1;
        }
    }

    plan
}

/// Selection order: effective priority (desc), merge_order (asc),
/// created_at (asc), id (lexical).
fn sort_by_selection_order(tasks: &mut [&Task], settings: &SchedulerSettings, now: DateTime<Utc>) {
    tasks.sort_by(|a, b| {
        effective_priority(b, settings, now)
            .cmp(&effective_priority(a, settings, now))
            .then(a.merge_order.cmp(&b.merge_order))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

/// Priority plus one point per full starvation interval spent waiting,
/// bounded so a stale backlog cannot override explicit priorities forever.
fn effective_priority(task: &Task, settings: &SchedulerSettings, now: DateTime<Utc>) -> i64 {
    if task.status != TaskStatus::Unclaimed {
        return task.priority;
    }
    let waited = now
        .signed_duration_since(task.updated_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    let intervals = if settings.starvation_ttl.is_zero() {
        0
    } else {
        (waited.as_secs() / settings.starvation_ttl.as_secs().max(1)) as i64
    };
    task.priority + intervals.min(MAX_STARVATION_BOOST)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn settings(max: u32) -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent: max,
            lookahead: max,
            starvation_ttl: Duration::from_secs(300),
        }
    }

    fn task(id: &str) -> Task {
        let mut t = Task::new(id, format!("branch-{id}"));
        t.id = id.to_string();
        t
    }

    #[test]
    fn independent_tasks_start_in_one_pass() {
        let mut a = task("a");
        a.priority = 5;
        a.merge_order = 1;
        a.exclusive_files = vec!["x.txt".into()];
        let mut b = task("b");
        b.priority = 5;
        b.merge_order = 2;
        b.exclusive_files = vec!["y.txt".into()];

        let plan = plan(&[a, b], &settings(2), Utc::now());
        assert_eq!(plan.promote, vec!["a", "b"]);
        // Budget has room for both, so both start within this same pass.
        assert_eq!(plan.start, vec!["a", "b"]);
        assert!(plan.demote.is_empty());
    }

    #[test]
    fn reserved_tasks_start_within_budget() {
        let mut a = task("a");
        a.status = TaskStatus::UpNext;
        let mut b = task("b");
        b.status = TaskStatus::UpNext;
        let mut c = task("c");
        c.status = TaskStatus::InProgress;
        c.session = Some("c-session".into());

        let plan = plan(&[a, b, c], &settings(2), Utc::now());
        // One slot free: exactly one of the reserved tasks starts.
        assert_eq!(plan.start.len(), 1);
    }

    #[test]
    fn dependency_gates_promotion() {
        let foundation = task("foundation");
        let mut feature = task("feature");
        feature.dependencies = vec!["foundation".into()];

        let tasks = vec![foundation, feature];
        let plan1 = plan(&tasks, &settings(5), Utc::now());
        assert_eq!(plan1.promote, vec!["foundation"]);

        let mut tasks = tasks;
        tasks[0].set_status(TaskStatus::Completed);
        let plan2 = plan(&tasks, &settings(5), Utc::now());
        assert_eq!(plan2.promote, vec!["feature"]);
    }

    #[test]
    fn exclusive_file_overlap_blocks_second_task() {
        let mut a = task("a");
        a.exclusive_files = vec!["config.json".into()];
        let mut b = task("b");
        b.exclusive_files = vec!["config.json".into()];

        let plan = plan(&[a, b], &settings(5), Utc::now());
        // Exactly one gets the reservation; no error for the other.
        assert_eq!(plan.promote.len(), 1);
    }

    #[test]
    fn shared_file_against_exclusive_blocks_both_directions() {
        let mut a = task("a");
        a.status = TaskStatus::InProgress;
        a.session = Some("a-session".into());
        a.shared_files = vec!["lib.rs".into()];
        let mut b = task("b");
        b.exclusive_files = vec!["lib.rs".into()];

        let plan = plan(&[a, b], &settings(5), Utc::now());
        assert!(plan.promote.is_empty());
    }

    #[test]
    fn selection_prefers_priority_then_merge_order_then_age() {
        let mut low = task("low");
        low.priority = 1;
        let mut high = task("high");
        high.priority = 9;
        let mut early = task("early");
        early.priority = 9;
        early.merge_order = -1;

        let plan = plan(&[low, high, early], &settings(1), Utc::now());
        assert_eq!(plan.start, vec!["early"]);
        assert_eq!(plan.promote.first().map(String::as_str), Some("early"));
    }

    #[test]
    fn starvation_boost_is_bounded() {
        let mut ancient = task("ancient");
        ancient.priority = 0;
        ancient.updated_at = Utc::now() - ChronoDuration::days(365);
        let mut vip = task("vip");
        vip.priority = MAX_STARVATION_BOOST + 1;

        let plan = plan(&[ancient, vip], &settings(1), Utc::now());
        // Even a year of waiting cannot beat priority 11.
        assert_eq!(plan.start, vec!["vip"]);
    }

    #[test]
    fn starvation_boost_eventually_wins_over_small_gaps() {
        let mut waiting = task("waiting");
        waiting.priority = 0;
        waiting.updated_at = Utc::now() - ChronoDuration::seconds(301 * 3);
        let mut fresh = task("fresh");
        fresh.priority = 2;

        let plan = plan(&[waiting, fresh], &settings(1), Utc::now());
        assert_eq!(plan.start, vec!["waiting"]);
    }

    #[test]
    fn up_next_with_deleted_dependency_is_demoted() {
        let mut orphan = task("orphan");
        orphan.status = TaskStatus::UpNext;
        orphan.dependencies = vec!["gone".into()];

        let plan = plan(&[orphan], &settings(5), Utc::now());
        assert_eq!(
            plan.demote,
            vec![("orphan".to_string(), DemotionReason::DependencyInvalid)]
        );
        assert!(plan.start.is_empty());
    }

    #[test]
    fn blocked_tasks_are_never_selected() {
        let mut b = task("b");
        b.blocked = true;
        let plan = plan(&[b], &settings(5), Utc::now());
        assert!(plan.is_empty());
    }

    #[test]
    fn budget_is_never_exceeded() {
        let mut tasks = Vec::new();
        for i in 0..10 {
            let mut t = task(&format!("t{i}"));
            if i < 3 {
                t.status = TaskStatus::InProgress;
                t.session = Some(format!("s{i}"));
            }
            tasks.push(t);
        }
        let plan = plan(&tasks, &settings(3), Utc::now());
        assert!(plan.start.is_empty(), "already at budget");
        // Reservations may still fill the lookahead.
        assert_eq!(plan.promote.len(), 3);
    }
}
