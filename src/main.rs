//! Agent swarm coordinator server entry point.

use swarm_coordinator::config::CoordinatorConfig;
use swarm_coordinator::{logging, server, Coordinator};
use std::net::SocketAddr;
use tracing::{error, info};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let config = match CoordinatorConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return std::process::ExitCode::from(1);
        }
    };

    logging::init_tracing(&config.logging);
    info!("configuration loaded");

    let host = config.server.host.clone();
    let port = config.server.port;

    let coordinator = match Coordinator::new(config).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!(error = %e, "failed to initialize coordinator");
            return std::process::ExitCode::from(1);
        }
    };
    info!(swarm_id = coordinator.swarm_id(), "coordinator initialized");

    let app = server::router(coordinator.clone());
    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "invalid bind address");
            return std::process::ExitCode::from(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind listener");
            return std::process::ExitCode::from(1);
        }
    };
    info!(%addr, "worker protocol server listening");

    let serve_coordinator = coordinator.clone();
    let serve = async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            error!(error = %e, "server exited with an error");
        }
        let _ = serve_coordinator;
    };

    let run_coordinator = coordinator.clone();
    let run = run_coordinator.run(shutdown_signal());

    tokio::join!(serve, run);

    if coordinator.recovery().is_emergency_stopped() {
        error!("swarm shut down while emergency-stopped");
        return std::process::ExitCode::from(2);
    }

    info!("coordinator shut down cleanly");
    std::process::ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
