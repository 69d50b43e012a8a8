use yamf::{init_tracing, start_registry, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);

    tracing::info!(environment = config.env().as_str(), "starting yamf registry");
    let server = start_registry(config, None).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down registry");
    server.terminate().await;

    Ok(())
}
