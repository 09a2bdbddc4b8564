use anyhow::{Context, Result};
use provider::{app, config::ProviderConfig, init_state};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = ProviderConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    let bind_addr = config.bind_addr.clone();
    let public_url = config.public_url.clone();
    let state = init_state(config).await.context("could not prepare the database")?;

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("could not bind {}", bind_addr))?;
    tracing::info!(%bind_addr, %public_url, "provider listening");

    axum::serve(listener, app(state)).await?;
    Ok(())
}
