use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::info;

use sm_coord::CoordinationRegistry;
use sm_core::config::OrchestratorConfig;
use sm_core::store::TaskStore;
use sm_session::SessionRunner;
use sm_telemetry::metrics::OrchestratorCounters;

use crate::api_error::ApiError;
use crate::event_bus::EventBus;
use crate::protocol::{ControlCommand, OrchestratorEvent};

// ---------------------------------------------------------------------------
// ProjectContext
// ---------------------------------------------------------------------------

/// Everything the control plane and the orchestrator loop share for one
/// project: the task store, the coordination registry, the event bus,
/// runtime config, and the command channel into the loop.
pub struct ProjectContext {
    pub id: String,
    pub root: PathBuf,
    pub store: Arc<TaskStore>,
    pub registry: Arc<CoordinationRegistry>,
    pub bus: EventBus,
    pub runner: Arc<SessionRunner>,
    pub config: RwLock<OrchestratorConfig>,
    /// Where `PUT /orchestrator/config` persists overrides.
    pub config_path: PathBuf,
    pub counters: Arc<OrchestratorCounters>,
    running: AtomicBool,
    commands_tx: flume::Sender<ControlCommand>,
    commands_rx: flume::Receiver<ControlCommand>,
}

impl ProjectContext {
    pub fn new(
        id: impl Into<String>,
        root: impl Into<PathBuf>,
        store: Arc<TaskStore>,
        registry: Arc<CoordinationRegistry>,
        runner: Arc<SessionRunner>,
        config: OrchestratorConfig,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        let (commands_tx, commands_rx) = flume::unbounded();
        Self {
            id: id.into(),
            root: root.into(),
            store,
            registry,
            bus: EventBus::new(),
            runner,
            config: RwLock::new(config),
            config_path: config_path.into(),
            counters: Arc::new(OrchestratorCounters::new()),
            running: AtomicBool::new(false),
            commands_tx,
            commands_rx,
        }
    }

    /// Publish onto the project bus, counting it.
    pub fn publish(&self, event: OrchestratorEvent) {
        OrchestratorCounters::incr(&self.counters.events_published);
        self.bus.publish(event);
    }

    pub fn send_command(&self, command: ControlCommand) {
        let _ = self.commands_tx.send(command);
    }

    /// The loop side of the command channel (flume receivers clone).
    pub fn command_receiver(&self) -> flume::Receiver<ControlCommand> {
        self.commands_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// ApiState
// ---------------------------------------------------------------------------

/// Called by the start endpoint to launch a project's orchestrator loop.
/// Registered by the daemon at startup; absent in bare API deployments.
pub type LoopLauncher = Arc<dyn Fn(Arc<ProjectContext>) + Send + Sync>;

pub struct ApiState {
    pub projects: DashMap<String, Arc<ProjectContext>>,
    pub started_at: Instant,
    launcher: std::sync::RwLock<Option<LoopLauncher>>,
}

impl ApiState {
    pub fn new() -> Self {
        Self {
            projects: DashMap::new(),
            started_at: Instant::now(),
            launcher: std::sync::RwLock::new(None),
        }
    }

    pub fn register_project(&self, ctx: Arc<ProjectContext>) {
        info!(project = %ctx.id, root = %ctx.root.display(), "project registered");
        self.projects.insert(ctx.id.clone(), ctx);
    }

    pub fn project(&self, id: &str) -> Result<Arc<ProjectContext>, ApiError> {
        self.projects
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ApiError::NotFound(format!("project {id}")))
    }

    pub fn set_loop_launcher(&self, launcher: LoopLauncher) {
        *self.launcher.write().expect("launcher lock") = Some(launcher);
    }

    pub fn loop_launcher(&self) -> Option<LoopLauncher> {
        self.launcher.read().expect("launcher lock").clone()
    }
}

impl Default for ApiState {
    fn default() -> Self {
        Self::new()
    }
}
