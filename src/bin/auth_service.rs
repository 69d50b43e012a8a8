use yamf::{auth_provider, init_tracing, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);

    tracing::info!("starting yamf auth provider");
    let service = auth_provider::start(&config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down auth provider");
    if let Err(err) = service.terminate().await {
        tracing::warn!(error = %err, "unregister on shutdown failed");
    }

    Ok(())
}
