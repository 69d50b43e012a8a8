use yamf::gateway::start_gateway;
use yamf::{init_tracing, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);

    tracing::info!(environment = config.env().as_str(), "starting yamf gateway");
    let server = start_gateway(config, None).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down gateway");
    server.terminate().await;

    Ok(())
}
