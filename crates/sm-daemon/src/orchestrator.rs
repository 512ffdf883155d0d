//! The per-project supervising orchestrator.
//!
//! Owns the project's scheduler, merge queue, completion detector, and
//! coordination-event feed, and drives every task status transition. The
//! durability rule throughout: the task store is written before the
//! corresponding external side effect (worktree creation, session spawn,
//! branch merge) is started, and the side effects are idempotent, so a
//! crashed run replays safely.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use sm_bridge::http_api::ProjectContext;
use sm_bridge::protocol::{ControlCommand, OrchestratorEvent, ResetReason};
use sm_core::config::{ConflictPolicy, OrchestratorConfig};
use sm_core::store::StoreError;
use sm_core::types::{CoordinationEvent, CoordinationEventKind, Task, TaskStatus};
use sm_core::worktree::{Provisioner, WorktreeError};
use sm_session::{CompletionDetector, CompletionOutcome, SessionError, SessionRunner};
use sm_telemetry::metrics::OrchestratorCounters;

use crate::merge_queue::{execute_merge, MergeError, MergeOutcome, MergeQueue};
use crate::scheduler::{self, SchedulerSettings};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("completion detector error: {0}")]
    Completion(#[from] sm_session::completion::CompletionError),
    #[error("merge error: {0}")]
    Merge(#[from] MergeError),
    /// The loop must halt; the control plane stays up for inspection.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// ProjectOrchestrator
// ---------------------------------------------------------------------------

pub struct ProjectOrchestrator {
    ctx: Arc<ProjectContext>,
    provisioner: Arc<Provisioner>,
    detector: CompletionDetector,
    queue: MergeQueue,
    coord_rx: flume::Receiver<CoordinationEvent>,
}

impl ProjectOrchestrator {
    /// Wire the orchestrator to a project. Registers itself as the sink
    /// for coordination events so agent RPCs surface on the bus.
    pub async fn new(ctx: Arc<ProjectContext>, provisioner: Arc<Provisioner>) -> Result<Self> {
        let status_dir = ctx.config.read().await.status_dir.clone();
        let detector = CompletionDetector::new(&status_dir)?;
        let (coord_tx, coord_rx) = flume::unbounded();
        ctx.registry.set_event_sink(coord_tx);
        Ok(Self {
            ctx,
            provisioner,
            detector,
            queue: MergeQueue::new(),
            coord_rx,
        })
    }

    async fn config(&self) -> OrchestratorConfig {
        self.ctx.config.read().await.clone()
    }

    // ------------------------------------------------------------------
    // Startup reconciliation
    // ------------------------------------------------------------------

    /// Repair state after a restart or crash: reap sessions that no
    /// longer exist, drop locks of dead agents, and rescan completion
    /// markers once before the first tick.
    pub async fn reconcile(&mut self) -> Result<()> {
        let cfg = self.config().await;
        let live = self.ctx.runner.list_live().unwrap_or_default();

        for task in self.ctx.store.list().await {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            let alive = task
                .session
                .as_deref()
                .map(|s| live.iter().any(|l| l == s))
                .unwrap_or(false);
            if !alive {
                warn!(task_id = %task.id, "in-progress task has no live session, resetting");
                self.fail_task(&task, ResetReason::HeartbeatTimeout, "session lost across restart")
                    .await?;
            }
        }

        for agent in self.ctx.registry.stale_agents(cfg.heartbeat_ttl()) {
            self.ctx.registry.reap_agent(&agent.session_name);
        }

        self.process_completions().await?;
        if cfg.auto_merge {
            let tasks = self.ctx.store.list().await;
            self.queue.sync(&tasks);
        }
        info!(project = %self.ctx.id, "reconcile complete");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tick phases
    // ------------------------------------------------------------------

    /// The fast phase: completions, coordination events, heartbeats, and
    /// one merge-queue step. Returns whether any task changed status, so
    /// the caller can run the scheduler off-cycle.
    pub async fn tick(&mut self) -> Result<bool> {
        self.detector.drain_notifications();
        let mut changed = self.process_completions().await?;
        changed |= self.forward_coordination_events().await?;
        changed |= self.check_heartbeats().await?;
        self.advance_merge_queue().await?;
        self.sweep_markers().await;
        Ok(changed)
    }

    /// Scan for completion markers and apply them.
    pub async fn process_completions(&mut self) -> Result<bool> {
        let mut changed = false;
        for signal in self.detector.scan() {
            let tasks = self.ctx.store.list().await;
            let Some(task) = tasks
                .iter()
                .find(|t| t.session.as_deref() == Some(signal.session_name.as_str()))
            else {
                // Marker for a session we do not own; orphan sweep handles it.
                continue;
            };
            match &signal.outcome {
                CompletionOutcome::Completed => {
                    self.complete_task(task).await?;
                }
                CompletionOutcome::Failed { reason } => {
                    warn!(task_id = %task.id, reason = %reason, "agent reported failure");
                    self.fail_task(task, ResetReason::AgentFailed, reason).await?;
                }
            }
            let _ = self.detector.consume(&signal.session_name);
            changed = true;
        }
        Ok(changed)
    }

    /// Mirror registry events onto the bus; `mark_task_completed` is an
    /// alternative completion path equivalent to the marker file.
    async fn forward_coordination_events(&mut self) -> Result<bool> {
        let mut changed = false;
        let events: Vec<CoordinationEvent> = self.coord_rx.drain().collect();
        for event in events {
            if event.kind == CoordinationEventKind::TaskCompletedSignal {
                let task_id = event
                    .payload
                    .get("task_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if let Some(task) = self.ctx.store.get(&task_id).await {
                    if task.status == TaskStatus::InProgress {
                        self.complete_task(&task).await?;
                        changed = true;
                    }
                }
            }
            self.ctx.publish(OrchestratorEvent::Coordination(event));
        }
        Ok(changed)
    }

    /// The only path that revokes IN_PROGRESS without a completion: no
    /// heartbeat within the TTL and no marker on disk.
    async fn check_heartbeats(&mut self) -> Result<bool> {
        let cfg = self.config().await;
        let ttl = cfg.heartbeat_ttl();
        let now = Utc::now();
        let mut changed = false;

        for task in self.ctx.store.list().await {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            let Some(session) = task.session.clone() else {
                continue;
            };
            if self.detector.marker_path(&session).exists() {
                continue; // completion already signalled, next scan takes it
            }
            let dead = match self.ctx.registry.get_agent(&session) {
                Some(agent) => now
                    .signed_duration_since(agent.last_heartbeat)
                    .to_std()
                    .map(|d| d > ttl)
                    .unwrap_or(false),
                // Never registered: measure from the moment we started it.
                None => now
                    .signed_duration_since(task.updated_at)
                    .to_std()
                    .map(|d| d > ttl)
                    .unwrap_or(false),
            };
            if dead {
                warn!(task_id = %task.id, session = %session, "heartbeat timeout, reclaiming task");
                OrchestratorCounters::incr(&self.ctx.counters.heartbeat_timeouts);
                self.fail_task(&task, ResetReason::HeartbeatTimeout, "heartbeat timeout")
                    .await?;
                changed = true;
            }
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// One scheduler pass: decide under the store snapshot, enact outside
    /// of it.
    pub async fn run_scheduler(&mut self) -> Result<()> {
        let cfg = self.config().await;
        let settings = SchedulerSettings::from(&cfg);
        let tasks = self.ctx.store.list().await;
        let plan = scheduler::plan(&tasks, &settings, Utc::now());
        if plan.is_empty() {
            return Ok(());
        }
        debug!(
            promote = plan.promote.len(),
            start = plan.start.len(),
            demote = plan.demote.len(),
            "enacting schedule plan"
        );

        for (task_id, _reason) in &plan.demote {
            let task = self.ctx.store.transition(task_id, TaskStatus::Unclaimed).await?;
            self.ctx.publish(OrchestratorEvent::TaskReset {
                task_id: task.id,
                reason: ResetReason::DependencyInvalid,
            });
        }

        for task_id in &plan.promote {
            let task = self.ctx.store.transition(task_id, TaskStatus::UpNext).await?;
            self.ctx.publish(OrchestratorEvent::TaskUpdated(task));
        }

        for task_id in &plan.start {
            if let Err(e) = self.start_task(task_id, &cfg).await {
                error!(task_id, error = %e, "task start failed");
            }
        }
        Ok(())
    }

    /// UP_NEXT -> IN_PROGRESS: persist the claim, provision the worktree,
    /// spawn the session. Any failure resets the task and burns one entry
    /// of its retry budget.
    async fn start_task(&mut self, task_id: &str, cfg: &OrchestratorConfig) -> Result<()> {
        let Some(task) = self.ctx.store.get(task_id).await else {
            return Ok(());
        };

        // Worktree base requirement: initialization deps must be merged.
        let tasks = self.ctx.store.list().await;
        let unmerged: Vec<String> = task
            .initialization_deps
            .iter()
            .filter(|d| {
                tasks
                    .iter()
                    .find(|t| &&t.id == d)
                    .map(|t| t.status != TaskStatus::Merged)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if !unmerged.is_empty() {
            debug!(task_id, ?unmerged, "waiting for initialization deps to merge");
            return Ok(());
        }

        let session = SessionRunner::session_name_for(&task);
        let claimed = self.ctx.store.claim(task_id, &session).await?;

        let spawn_result = self.provision_and_spawn(&claimed, cfg).await;
        match spawn_result {
            Ok(()) => {
                OrchestratorCounters::incr(&self.ctx.counters.spawns);
                info!(task_id, session = %session, "agent started");
                if let Some(task) = self.ctx.store.get(task_id).await {
                    self.ctx.publish(OrchestratorEvent::TaskUpdated(task));
                }
                Ok(())
            }
            Err(e) => {
                OrchestratorCounters::incr(&self.ctx.counters.spawn_failures);
                warn!(task_id, error = %e, "spawn failed, resetting task");
                self.ctx.publish(OrchestratorEvent::SpawnFailed {
                    task_id: task_id.to_string(),
                    error: e.to_string(),
                });
                let _ = self.ctx.runner.kill(&session);
                self.fail_task(&claimed, ResetReason::SpawnFailed, &e.to_string())
                    .await?;
                Ok(())
            }
        }
    }

    async fn provision_and_spawn(&self, task: &Task, cfg: &OrchestratorConfig) -> Result<()> {
        let info = self.provisioner.provision(task, &[])?;
        let runner = self.ctx.runner.clone();
        let spawn_task = task.clone();
        let status_dir = cfg.status_dir.clone();
        let workdir = info.path.clone();

        let spawn = tokio::task::spawn_blocking(move || {
            runner.spawn(&spawn_task, &workdir, &status_dir)
        });
        match tokio::time::timeout(cfg.spawn_timeout(), spawn).await {
            Ok(Ok(Ok(_session))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(join_err)) => Err(OrchestratorError::Fatal(format!(
                "spawn task panicked: {join_err}"
            ))),
            Err(_) => Err(OrchestratorError::Session(SessionError::MuxCommand(
                format!("spawn timed out after {}s", cfg.spawn_timeout_s),
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Completion / failure transitions
    // ------------------------------------------------------------------

    async fn complete_task(&mut self, task: &Task) -> Result<()> {
        let session = task.session.clone().unwrap_or_default();
        // Durable first, then the session teardown side effects.
        let updated = self
            .ctx
            .store
            .transition(&task.id, TaskStatus::Completed)
            .await?;
        let _ = self.ctx.runner.kill(&session);
        self.ctx.registry.reap_agent(&session);
        let _ = self.detector.consume(&session);

        OrchestratorCounters::incr(&self.ctx.counters.completions);
        info!(task_id = %task.id, session = %session, "task completed");
        self.ctx.publish(OrchestratorEvent::TaskCompleted {
            task_id: updated.id.clone(),
            session,
        });
        let cfg = self.config().await;
        if cfg.auto_merge {
            self.queue.enqueue(&updated);
        }
        Ok(())
    }

    /// Reset a task to UNCLAIMED, burning one retry. Past the budget the
    /// task is marked blocked and waits for a manual reset.
    async fn fail_task(&mut self, task: &Task, reason: ResetReason, detail: &str) -> Result<()> {
        let max_retries = self.config().await.max_spawn_retries;
        let updated = self
            .ctx
            .store
            .update(&task.id, |t| {
                t.spawn_attempts += 1;
                if t.spawn_attempts >= max_retries {
                    t.blocked = true;
                }
            })
            .await?;
        if task.status != TaskStatus::Unclaimed {
            self.ctx
                .store
                .transition(&task.id, TaskStatus::Unclaimed)
                .await?;
        }

        if let Some(session) = &task.session {
            let _ = self.ctx.runner.kill(session);
            self.ctx.registry.reap_agent(session);
            let _ = self.detector.consume(session);
        }

        OrchestratorCounters::incr(&self.ctx.counters.task_resets);
        self.ctx.publish(OrchestratorEvent::TaskReset {
            task_id: task.id.clone(),
            reason,
        });
        if updated.blocked {
            warn!(task_id = %task.id, attempts = updated.spawn_attempts, detail, "retry budget exhausted, task blocked");
            self.ctx.publish(OrchestratorEvent::TaskBlocked {
                task_id: task.id.clone(),
                attempts: updated.spawn_attempts,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Merge queue
    // ------------------------------------------------------------------

    /// At most one merge per call; the mainline sees a serialized
    /// sequence of integrations.
    pub async fn advance_merge_queue(&mut self) -> Result<()> {
        let cfg = self.config().await;
        let tasks = self.ctx.store.list().await;
        if cfg.auto_merge {
            self.queue.sync(&tasks);
        }
        if self.queue.is_paused() || self.queue.is_empty() {
            return Ok(());
        }

        let registry = self.ctx.registry.clone();
        let Some(task) = self
            .queue
            .next_mergeable(&tasks, |t| registry.locked_paths_among(t.touched_files()))
        else {
            return Ok(());
        };
        let task = task.clone();

        self.ctx.publish(OrchestratorEvent::MergeStarted {
            task_id: task.id.clone(),
            branch: task.branch.clone(),
        });

        let provisioner = self.provisioner.clone();
        let merge_task = task.clone();
        let strategy = cfg.merge_strategy;
        let ff_only = cfg.ff_only;
        let merge = tokio::task::spawn_blocking(move || {
            execute_merge(&provisioner, &merge_task, strategy, ff_only)
        });

        let outcome = match tokio::time::timeout(cfg.merge_timeout(), merge).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(e))) => {
                // Transient git failure: surface and retry on a later tick.
                OrchestratorCounters::incr(&self.ctx.counters.merges_failed);
                self.ctx.publish(OrchestratorEvent::Error {
                    kind: "merge_io".to_string(),
                    message: e.to_string(),
                    retry_after_s: Some(cfg.auto_spawn_interval_s),
                });
                return Ok(());
            }
            Ok(Err(join_err)) => {
                return Err(OrchestratorError::Fatal(format!(
                    "merge task panicked: {join_err}"
                )));
            }
            Err(_) => MergeOutcome::Conflict(vec![format!(
                "merge timed out after {}s",
                cfg.merge_timeout_s
            )]),
        };

        match outcome {
            MergeOutcome::Merged | MergeOutcome::AlreadyMerged | MergeOutcome::NothingToMerge => {
                let updated = self.ctx.store.transition(&task.id, TaskStatus::Merged).await?;
                if let Err(e) = self.provisioner.tear_down(&task.branch, true) {
                    warn!(branch = %task.branch, error = %e, "worktree teardown failed");
                }
                self.queue.drop_task(&task.id);
                OrchestratorCounters::incr(&self.ctx.counters.merges_completed);
                info!(task_id = %updated.id, branch = %task.branch, "branch merged");
                self.ctx.publish(OrchestratorEvent::MergeCompleted {
                    task_id: updated.id,
                    branch: task.branch.clone(),
                });
            }
            MergeOutcome::Conflict(conflicts) => {
                OrchestratorCounters::incr(&self.ctx.counters.merges_failed);
                let reason = format!("merge conflict in {} file(s)", conflicts.len());
                self.ctx.publish(OrchestratorEvent::MergeFailed {
                    task_id: task.id.clone(),
                    branch: task.branch.clone(),
                    reason: reason.clone(),
                    conflicts: conflicts.clone(),
                });
                match cfg.conflict_policy {
                    ConflictPolicy::Hold => {
                        self.queue.hold_task(&task.id);
                    }
                    ConflictPolicy::ResetTask => {
                        self.ctx
                            .store
                            .transition(&task.id, TaskStatus::Unclaimed)
                            .await?;
                        if let Err(e) = self.provisioner.tear_down(&task.branch, true) {
                            warn!(branch = %task.branch, error = %e, "teardown after conflict failed");
                        }
                        self.queue.drop_task(&task.id);
                        OrchestratorCounters::incr(&self.ctx.counters.task_resets);
                        self.ctx.publish(OrchestratorEvent::TaskReset {
                            task_id: task.id.clone(),
                            reason: ResetReason::MergeConflict,
                        });
                    }
                    ConflictPolicy::Abort => {
                        self.queue.pause(reason);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn merge_preview(
        &self,
        tasks: &[Task],
    ) -> Vec<crate::merge_queue::MergePlanEntry> {
        let registry = self.ctx.registry.clone();
        self.queue
            .preview(tasks, |t| registry.locked_paths_among(t.touched_files()))
    }

    // ------------------------------------------------------------------
    // Commands & shutdown
    // ------------------------------------------------------------------

    /// Returns `false` when the loop should stop.
    pub async fn handle_command(&mut self, command: ControlCommand) -> bool {
        match command {
            ControlCommand::Stop => false,
            ControlCommand::ResetTask { task_id } => {
                self.queue.drop_task(&task_id);
                true
            }
            ControlCommand::EnqueueMerge { task_id } => {
                if let Some(task) = self.ctx.store.get(&task_id).await {
                    if task.status == TaskStatus::Completed {
                        self.queue.enqueue(&task);
                    }
                }
                true
            }
            ControlCommand::AcknowledgeMergeFailure => {
                self.queue.acknowledge();
                true
            }
        }
    }

    /// Graceful stop: give agents the configured grace period to drop
    /// completion markers, then force-kill the remainder and flush.
    pub async fn shutdown(&mut self) {
        let cfg = self.config().await;
        info!(project = %self.ctx.id, grace_s = cfg.shutdown_grace_s, "orchestrator stopping");

        let deadline = tokio::time::Instant::now() + cfg.shutdown_grace();
        loop {
            let _ = self.process_completions().await;
            let any_running = self
                .ctx
                .store
                .list()
                .await
                .iter()
                .any(|t| t.status == TaskStatus::InProgress);
            if !any_running || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        for task in self.ctx.store.list().await {
            if task.status == TaskStatus::InProgress {
                if let Some(session) = &task.session {
                    warn!(task_id = %task.id, session = %session, "force-killing session at shutdown");
                    let _ = self.ctx.runner.kill(session);
                    self.ctx.registry.reap_agent(session);
                }
            }
        }

        if let Err(e) = self.ctx.store.flush().await {
            error!(error = %e, "task store flush failed at shutdown");
        }
        self.ctx.publish(OrchestratorEvent::OrchestratorStopped {
            project_id: self.ctx.id.clone(),
        });
        self.ctx.set_running(false);
    }

    async fn sweep_markers(&mut self) {
        let sessions: Vec<String> = self
            .ctx
            .store
            .list()
            .await
            .iter()
            .filter_map(|t| t.session.clone())
            .collect();
        self.detector
            .sweep_orphans(Duration::from_secs(3600), &sessions);
    }
}
