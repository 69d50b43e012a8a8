//! The gateway process: a pull-synchronized mirror of registry state behind
//! the same dispatcher the registry runs.

use std::sync::Arc;

use chrono::Utc;
use tokio::net::TcpListener;

use crate::client::RegistryClient;
use crate::config::Config;
use crate::error::Result;
use crate::server::{serve, App, Role, ServerHandle};

/// Pull the registry snapshot and swap it in as the new mirror. The swap
/// holds every map's write lock, so dispatch never sees a partial mirror.
pub async fn refresh_mirror(app: &App) -> Result<()> {
    let client = RegistryClient::from_config(&app.config)?;
    let snapshot = client.pull().await?;
    let snapshot_time = snapshot.timestamp;
    app.state.replace_from_snapshot(snapshot).await;
    app.set_last_pull(Utc::now().timestamp_millis());
    tracing::debug!(snapshot_time, "gateway mirror refreshed");
    Ok(())
}

/// Fire-and-forget refresh, used when the registry says something changed.
/// The notification payload is never trusted; the gateway pulls.
pub fn spawn_refresh(app: Arc<App>) {
    tokio::spawn(async move {
        if let Err(err) = refresh_mirror(&app).await {
            tracing::warn!(error = %err, "gateway mirror refresh failed");
        }
    });
}

/// Boot the gateway: validate, bind, take the initial pull, dispatch.
pub async fn start_gateway(
    mut config: Config,
    port_override: Option<u16>,
) -> anyhow::Result<ServerHandle> {
    config.validate_for_gateway()?;

    let port = match port_override {
        Some(port) => port,
        None => config
            .gateway_url
            .as_deref()
            .and_then(|url| reqwest::Url::parse(url).ok())
            .and_then(|url| url.port_or_known_default())
            .ok_or_else(|| anyhow::anyhow!("YAMF_GATEWAY_URL with a port is required"))?,
    };
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    if config.gateway_url.is_none() || port_override == Some(0) {
        config.gateway_url = Some(format!("http://127.0.0.1:{}", addr.port()));
    }

    let app = Arc::new(App::new(config, Role::Gateway));

    if app.config.registry_url.is_some() {
        // A registry that is not up yet is not fatal; the next update
        // notification triggers another pull.
        match refresh_mirror(&app).await {
            Ok(()) => tracing::info!("initial registry pull complete"),
            Err(err) => tracing::warn!(error = %err, "initial registry pull failed"),
        }
    }

    let (cancel, task) = serve(app.clone(), listener);
    tracing::info!(%addr, "gateway listening");

    Ok(ServerHandle {
        app,
        addr,
        cancel,
        task,
    })
}
