//! splitmind daemon: serves the control plane and supervises one
//! project's agents.
//!
//! Exit codes: 0 success, 2 usage error, 3 configuration error,
//! 4 unrecoverable orchestrator error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use sm_bridge::http_api::{ApiState, ProjectContext};
use sm_coord::CoordinationRegistry;
use sm_core::config::OrchestratorConfig;
use sm_core::store::TaskStore;
use sm_daemon::daemon::Daemon;
use sm_daemon::lockfile;
use sm_session::SessionRunner;

const EXIT_CONFIG: u8 = 3;
const EXIT_FATAL: u8 = 4;

/// SplitMind orchestrator daemon.
#[derive(Parser)]
#[command(name = "sm-daemon", version, about)]
struct Cli {
    /// Project repository root.
    #[arg(long, default_value = ".")]
    project: PathBuf,

    /// Project identifier; defaults to the repository directory name.
    #[arg(long)]
    project_id: Option<String>,

    /// Config file path; defaults to ~/.splitmind/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind the control plane on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind; 0 lets the OS choose.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Emit JSON logs instead of human-readable ones.
    #[arg(long)]
    json_logs: bool,

    /// Replace an already-running daemon.
    #[arg(long, short = 'r')]
    replace: bool,

    /// Register the project but do not start its orchestrator loop.
    #[arg(long)]
    no_start: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.json_logs {
        sm_telemetry::logging::init_logging_json("sm-daemon", "info");
    } else {
        sm_telemetry::logging::init_logging("sm-daemon", "info");
    }

    // --- Config ---------------------------------------------------------
    let config = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("sm-daemon: config error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // --- Single-instance guard ------------------------------------------
    if let Some(existing) = lockfile::probe() {
        if cli.replace {
            info!(pid = existing.pid, "replacing running daemon");
            #[cfg(unix)]
            unsafe {
                libc::kill(existing.pid as i32, libc::SIGTERM);
            }
            // Once the old process is gone its lock line probes as stale
            // and the acquire below sweeps it.
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        } else {
            eprintln!(
                "sm-daemon: already running (pid={}, api={}): use --replace to restart",
                existing.pid,
                existing.api_url()
            );
            return ExitCode::from(EXIT_FATAL);
        }
    }

    // --- Project wiring --------------------------------------------------
    let project_root = match cli.project.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            eprintln!(
                "sm-daemon: project root {} is not accessible: {e}",
                cli.project.display()
            );
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let project_id = cli.project_id.clone().unwrap_or_else(|| {
        project_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "default".to_string())
    });

    let store = match TaskStore::open(project_root.join("tasks.md")).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("sm-daemon: cannot open task store: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let registry = Arc::new(CoordinationRegistry::new());
    let runner = Arc::new(SessionRunner::new(&config.agent_command));
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(OrchestratorConfig::default_path);
    let ctx = Arc::new(ProjectContext::new(
        project_id.clone(),
        project_root.clone(),
        store,
        registry,
        runner,
        config,
        config_path,
    ));

    let state = Arc::new(ApiState::new());
    state.register_project(ctx.clone());
    let daemon = Daemon::new(state.clone());

    // --- Bind & lock -----------------------------------------------------
    let bind = format!("{}:{}", cli.host, cli.port);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("sm-daemon: cannot bind {bind}: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };
    let api_port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            eprintln!("sm-daemon: cannot read bound address: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    // Held for the rest of main; dropping it releases the lock file.
    let _instance = match lockfile::acquire(&cli.host, api_port) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("sm-daemon: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    info!(project = %project_id, api_port, "sm-daemon starting");

    if cli.no_start {
        info!("orchestrator loop not started (--no-start); use the start endpoint");
    } else {
        daemon.start_project(ctx);
    }

    // --- Ctrl-C ----------------------------------------------------------
    let lifecycle = daemon.lifecycle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down");
            lifecycle.request_stop();
        }
    });

    let result = daemon.run(listener).await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sm-daemon: {e}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig, String> {
    let config = match &cli.config {
        Some(path) => OrchestratorConfig::load_from(path).map_err(|e| e.to_string())?,
        None => OrchestratorConfig::load().map_err(|e| e.to_string())?,
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}
