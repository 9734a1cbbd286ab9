mod api;
mod state;

use std::process::ExitCode;
use std::time::Duration;

use log::info;
use scriptline::worker::TriggerScheduler;

use state::{AppState, ServerError};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn run() -> Result<(), ServerError> {
    let config = scriptline::load_config_from_env()?;
    scriptline::logging::init(&config.logging);
    api::handlers::START_TIME.get_or_init(std::time::Instant::now);

    info!("Starting scriptline-server v{}", env!("CARGO_PKG_VERSION"));

    let bind = config.server.bind.clone();
    let cors_origins = config.server.cors_origins.clone();
    let scheduler_config = config.scheduler.clone();
    let state = AppState::from_config(config)?;

    let scheduler = scheduler_config.enabled.then(|| {
        let scheduler = TriggerScheduler::new(
            state.orchestrator.clone(),
            Duration::from_secs(scheduler_config.interval_secs),
            scheduler_config.users.clone(),
        );
        let handle = scheduler.start(state.scheduler_trigger.subscribe());
        info!(
            "Scheduler running every {}s",
            scheduler_config.interval_secs
        );
        (scheduler, handle)
    });

    let router = api::build_router(state.clone(), &cors_origins);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Listening on {}", bind);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.orchestrator.shutdown();
    if let Some((scheduler, handle)) = scheduler {
        scheduler.stop();
        let _ = state.scheduler_trigger.send(());
        if let Err(e) = handle.await {
            log::warn!("Scheduler task ended abnormally: {}", e);
        }
    }
    info!("Server stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("scriptline-server: {}", e);
            ExitCode::FAILURE
        }
    }
}
