//! The daemon shell: per-project orchestrator loops and the API server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

use sm_bridge::http_api::{api_router, ApiState, ProjectContext};
use sm_bridge::protocol::OrchestratorEvent;
use sm_core::worktree::Provisioner;

use crate::lifecycle::Lifecycle;
use crate::orchestrator::{OrchestratorError, ProjectOrchestrator};

/// Cadence of the fast phase (completions, heartbeats, merge step). The
/// completion detector's polling fallback rides on this, so it stays at
/// or under two seconds.
pub const FAST_TICK: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Owns the shared API state and the daemon lifecycle, and wires the
/// start endpoint to real orchestrator loops.
pub struct Daemon {
    state: Arc<ApiState>,
    lifecycle: Lifecycle,
}

impl Daemon {
    pub fn new(state: Arc<ApiState>) -> Self {
        let daemon = Self {
            state,
            lifecycle: Lifecycle::new(),
        };
        daemon.install_launcher();
        daemon
    }

    pub fn state(&self) -> &Arc<ApiState> {
        &self.state
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Register the loop launcher used by `POST /orchestrator/start`.
    fn install_launcher(&self) {
        let lifecycle = self.lifecycle.clone();
        self.state.set_loop_launcher(Arc::new(move |ctx| {
            // Marked running synchronously so a racing second start is a
            // no-op rather than a second loop.
            if ctx.is_running() {
                return;
            }
            ctx.set_running(true);
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                run_project_loop(ctx, lifecycle).await;
            });
        }));
    }

    /// Launch the loop for an already-registered project.
    pub fn start_project(&self, ctx: Arc<ProjectContext>) {
        if let Some(launcher) = self.state.loop_launcher() {
            launcher(ctx);
        }
    }

    /// Serve the control plane until a stop is requested (blocking).
    pub async fn run(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let router = api_router(self.state.clone());
        let addr = listener.local_addr()?;
        info!(%addr, "control plane listening");

        let stop = self.lifecycle.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop.stopped().await })
            .await
            .context("API server failed")?;

        // Project loops saw the same stop latch; wait for their guards.
        self.lifecycle
            .wait_until_idle(Duration::from_secs(60))
            .await;
        info!("daemon stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Project loop
// ---------------------------------------------------------------------------

/// The supervising loop for one project: reconcile once, then alternate
/// fast ticks with scheduler passes until stopped.
pub async fn run_project_loop(ctx: Arc<ProjectContext>, lifecycle: Lifecycle) {
    let _guard = lifecycle.attach_loop(&ctx.id);
    ctx.set_running(true);

    let mainline = ctx.config.read().await.mainline_branch.clone();
    let provisioner = Arc::new(Provisioner::new(ctx.root.clone(), mainline));

    let mut orchestrator = match ProjectOrchestrator::new(ctx.clone(), provisioner).await {
        Ok(o) => o,
        Err(e) => {
            error!(project = %ctx.id, error = %e, "orchestrator could not start");
            ctx.publish(OrchestratorEvent::Fatal {
                message: e.to_string(),
            });
            ctx.set_running(false);
            return;
        }
    };

    if let Err(e) = orchestrator.reconcile().await {
        error!(project = %ctx.id, error = %e, "reconcile failed");
        ctx.publish(OrchestratorEvent::Fatal {
            message: e.to_string(),
        });
        ctx.set_running(false);
        return;
    }

    ctx.publish(OrchestratorEvent::OrchestratorStarted {
        project_id: ctx.id.clone(),
    });
    info!(project = %ctx.id, "orchestrator loop running");

    let commands = ctx.command_receiver();
    let mut tick = tokio::time::interval(FAST_TICK);
    tick.tick().await; // consume the immediate first fire
    let mut last_scheduler_run: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let changed = match orchestrator.tick().await {
                    Ok(changed) => changed,
                    Err(e) => {
                        if halt_on(&ctx, &e) { break; }
                        false
                    }
                };

                let spawn_interval = ctx.config.read().await.spawn_interval();
                let due = last_scheduler_run
                    .map(|t| t.elapsed() >= spawn_interval)
                    .unwrap_or(true);
                if changed || due {
                    last_scheduler_run = Some(tokio::time::Instant::now());
                    if let Err(e) = orchestrator.run_scheduler().await {
                        if halt_on(&ctx, &e) { break; }
                    }
                }
            }
            command = commands.recv_async() => {
                match command {
                    Ok(command) => {
                        if !orchestrator.handle_command(command).await {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            _ = lifecycle.stopped() => break,
        }
    }

    orchestrator.shutdown().await;
}

/// Fatal errors halt the loop (the control plane stays reachable);
/// everything else is logged and retried on the next tick.
fn halt_on(ctx: &ProjectContext, e: &OrchestratorError) -> bool {
    match e {
        OrchestratorError::Fatal(message) => {
            error!(project = %ctx.id, message = %message, "fatal orchestrator error, halting loop");
            ctx.publish(OrchestratorEvent::Fatal {
                message: message.clone(),
            });
            true
        }
        other => {
            error!(project = %ctx.id, error = %other, "tick error");
            ctx.publish(OrchestratorEvent::Error {
                kind: "tick".to_string(),
                message: other.to_string(),
                retry_after_s: Some(FAST_TICK.as_secs()),
            });
            false
        }
    }
}
