use velesio_agent::{AgentConfig, SdSupervisor, Supervisor, http, state::AppState};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::from_env()?;
    tracing::info!(
        worker_bin = %config.supervisor.worker_bin.display(),
        models_dir = %config.supervisor.models_dir.display(),
        log_dir = %config.supervisor.log_dir.display(),
        ports = ?config.ports.external_ports(),
        sd_root = %config.sd.root.display(),
        sd_port = config.sd.port,
        "supervisor configured"
    );

    let supervisor = Supervisor::new(config.supervisor, config.ports);
    let sd = SdSupervisor::new(config.sd);
    let app = http::router(AppState::new(supervisor.clone(), sd.clone()));

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(addr = %config.listen, "velesio-agent HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Workers outlive the HTTP server only until they are stopped here.
    let (_, sd_stop) = tokio::join!(supervisor.shutdown(), sd.stop());
    if let Err(err) = sd_stop {
        tracing::warn!(%err, "stable diffusion did not stop cleanly");
    }
    Ok(())
}
