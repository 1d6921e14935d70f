use agent_inbox::config::{load_config, LoggingConfig};
use agent_inbox::create_app;
use anyhow::Result;
use tracing_subscriber::EnvFilter;

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match logging.format.as_str() {
        "json" => tracing_subscriber::fmt().with_env_filter(filter).with_target(false).json().init(),
        "pretty" => tracing_subscriber::fmt().with_env_filter(filter).with_target(false).pretty().init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config();
    init_logging(&config.logging);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let (_state, app) = create_app(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "agent-inbox listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("agent-inbox stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
    }
}
