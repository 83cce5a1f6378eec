use std::sync::Arc;

use browser_tasks::config::EngineConfig;
use browser_tasks::engine::Engine;
use browser_tasks::session::HttpDriver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env()?;

    eprintln!("Browser tasks v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/tasks", config.port);
    eprintln!("   Task WS: ws://0.0.0.0:{}/ws/tasks/{{id}}", config.port);
    eprintln!("   Driver: {}", config.driver.base_url);
    eprintln!(
        "   Tasks evicted after {}s (sweep every {}s)",
        config.max_task_age.as_secs(),
        config.reaper_interval.as_secs()
    );
    match &config.artifact_dir {
        Some(dir) => eprintln!("   Artifacts: {}", dir.display()),
        None => eprintln!("   Artifacts: in memory"),
    }

    let artifacts = Engine::artifacts_from_config(&config).await?;
    let driver = Arc::new(HttpDriver::new(&config.driver));
    let port = config.port;
    let engine = Engine::new(config, driver, artifacts);
    let handle = engine.start();

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "HTTP server started");
    axum::serve(listener, engine.router())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    handle.shutdown().await;
    Ok(())
}
