// src/main.rs

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use txflow::config::EngineConfig;
use txflow::crypto::Sha256Kernel;
use txflow::engine::{Engine, EngineError};
use txflow::rpc::{self, AppState};
use txflow::server::ServerError;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match EngineConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    info!(
        bind = %config.bind,
        workers = config.workers,
        block_size = config.block_size,
        "starting txflow engine"
    );

    let engine = Engine::new(config.clone(), Arc::new(Sha256Kernel));
    if let Err(e) = engine.start().await {
        error!(error = %e, "engine failed to start");
        return match e {
            EngineError::Server(ServerError::Bind { .. }) => ExitCode::from(2),
            EngineError::Net(txflow::net::NetError::Bind { .. }) => ExitCode::from(2),
            _ => ExitCode::from(1),
        };
    }

    // Admin surface runs for the life of the process.
    {
        let state = AppState { engine: engine.clone() };
        let admin_bind = config.admin_bind.clone();
        tokio::spawn(async move {
            if let Err(e) = rpc::serve(state, &admin_bind).await {
                warn!(error = %e, bind = %admin_bind, "admin server exited");
            }
        });
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => warn!(error = %e, "signal listener failed; shutting down"),
    }

    engine.stop().await;
    info!("engine shut down cleanly");
    ExitCode::SUCCESS
}
