use anyhow::Context;
use medical_qa_service::{Settings, create_app, telemetry::init_tracing};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("Failed to load configuration")?;
    init_tracing(settings.log_format);

    info!(
        app_name = %settings.app_name,
        app_version = %settings.app_version,
        environment = %settings.environment,
        "Starting medical QA service"
    );

    let app = create_app(&settings)
        .await
        .context("Failed to initialize service providers")?;

    let listener = TcpListener::bind(("0.0.0.0", settings.port)).await?;
    let addr = listener.local_addr()?;

    info!("Medical QA service listening on {}", addr);
    info!("Health check endpoint: http://{}/api/v1/healthy", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
