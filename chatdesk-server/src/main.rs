//! chatdesk-server - Chatdesk backend server
//!
//! Administrative REST API for chat sessions and HITL escalation.

use chatdesk_core::{Database, ServiceToken};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod error;
mod middleware;
mod routes;
mod services;
mod state;

use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("chatdesk_server=info".parse()?)
                .add_directive("chatdesk_core=info".parse()?),
        )
        .init();

    info!("chatdesk-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = config::Config::load()?;
    info!("Config loaded from {:?}", config.config_path);

    // Check for existing server
    if config.pid_file.exists() {
        let pid_str = std::fs::read_to_string(&config.pid_file)?;
        let pid: i32 = pid_str.trim().parse()?;

        // Check if process is still running
        if process_exists(pid) {
            anyhow::bail!("Server already running with PID {}", pid);
        }

        info!("Cleaning up stale PID file from previous crash");
        let _ = std::fs::remove_file(&config.pid_file);
    }

    let db = Database::open_path(&config.database_path)?;
    info!("Database opened at {:?}", config.database_path);

    let service_token = ServiceToken::load_or_generate(&config.service_token_file)?;
    info!("Service token at {:?}", config.service_token_file);

    let bind_address = config.bind_address;
    let pid_file = config.pid_file.clone();
    info!(
        idle_timeout_minutes = config.session.idle_timeout_minutes,
        "Session rollover configured"
    );

    let state = AppState::new(config, db, service_token);
    let subscribers = state.spawn_subscribers();
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    std::fs::write(&pid_file, std::process::id().to_string())?;
    info!("Listening on http://{}", listener.local_addr()?);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    for handle in subscribers {
        handle.abort();
    }
    if let Err(e) = std::fs::remove_file(&pid_file) {
        warn!("Failed to remove PID file: {}", e);
    }

    served?;
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

/// Check if a process exists by PID
fn process_exists(pid: i32) -> bool {
    // On Unix, sending signal 0 checks if process exists
    unsafe { libc::kill(pid, 0) == 0 }
}
