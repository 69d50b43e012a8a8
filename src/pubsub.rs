//! Publish/subscribe fan-out and the registry→gateway change notification.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{HttpError, Result};
use crate::protocol::{
    Payload, GATEWAY_SERVICE, HEADER_COMMAND, HEADER_PUBSUB_CHANNEL, HEADER_REGISTRY_UPDATED,
    REGISTER_CHANNEL,
};
use crate::server::App;
use crate::state::RegistryState;

/// Aggregated per-subscriber outcome of one publish. A failing subscriber
/// never prevents delivery to the others.
#[derive(Debug, Default, Serialize)]
pub struct PublishOutcome {
    pub results: Vec<Value>,
    pub errors: Vec<Value>,
}

/// An internal `register`-channel event telling subscribed services that
/// registry state changed.
#[derive(Debug, Clone, Serialize)]
pub struct CacheUpdate {
    pub subscription: String,
    pub service: String,
    pub location: String,
}

/// Deliver a message to every current subscriber of a channel, in insertion
/// order, one at a time so a slow subscriber cannot reorder deliveries.
pub async fn publish(app: &App, channel: &str, payload: &Payload) -> PublishOutcome {
    let subscribers = {
        let subscriptions = app.state.subscriptions.read().await;
        subscriptions.get(channel).cloned().unwrap_or_default()
    };

    let mut outcome = PublishOutcome::default();
    for location in subscribers {
        match deliver(app, channel, &location, payload).await {
            Ok(result) => outcome.results.push(json!({
                "location": location,
                "result": result,
            })),
            Err(err) => {
                tracing::warn!(channel, %location, error = %err, "publish delivery failed");
                outcome.errors.push(json!({
                    "location": location,
                    "error": err.to_string(),
                }));
            }
        }
    }
    outcome
}

async fn deliver(app: &App, channel: &str, location: &str, payload: &Payload) -> Result<Value> {
    let mut request = app
        .http
        .post(location)
        .header(HEADER_COMMAND, "pubsub-publish")
        .header(HEADER_PUBSUB_CHANNEL, channel);
    request = match payload {
        Payload::Json(value) => request.json(value),
        Payload::Raw(bytes) => request
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.clone()),
        Payload::Empty => request,
    };

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(HttpError::BadGateway(format!(
            "subscriber replied {status}: {detail}"
        )));
    }
    Ok(response.json().await.unwrap_or(Value::Null))
}

/// Add a subscriber endpoint to a channel, then announce the change on the
/// register channel.
pub async fn subscribe(app: &App, channel: &str, service: &str, location: &str) -> Result<Value> {
    if channel.is_empty() {
        return Err(HttpError::BadRequest("channel name must not be empty".into()));
    }
    if location.is_empty() {
        return Err(HttpError::BadRequest(
            "subscriber location must not be empty".into(),
        ));
    }

    {
        let mut subscriptions = app.state.subscriptions.write().await;
        let subscribers = subscriptions.entry(channel.to_string()).or_default();
        if !subscribers.iter().any(|existing| existing == location) {
            subscribers.push(location.to_string());
        }
    }
    tracing::debug!(channel, service, location, "subscribed");

    publish_cache_update(
        app,
        CacheUpdate {
            subscription: channel.to_string(),
            service: service.to_string(),
            location: location.to_string(),
        },
    )
    .await;

    Ok(json!({ "channel": channel, "location": location }))
}

/// Remove a subscriber from a channel; empty channels are deleted.
pub async fn unsubscribe(state: &RegistryState, channel: &str, location: &str) -> Result<Value> {
    let mut subscriptions = state.subscriptions.write().await;
    let removed = match subscriptions.get_mut(channel) {
        Some(subscribers) => {
            let before = subscribers.len();
            subscribers.retain(|existing| existing != location);
            let removed = subscribers.len() != before;
            if subscribers.is_empty() {
                subscriptions.remove(channel);
            }
            removed
        }
        None => false,
    };
    Ok(json!({ "channel": channel, "location": location, "removed": removed }))
}

/// Push a cache-update event to every register-channel subscriber and let
/// the gateway know it should pull. Failures are logged, never propagated.
pub async fn publish_cache_update(app: &App, update: CacheUpdate) {
    let subscribers = {
        let subscriptions = app.state.subscriptions.read().await;
        subscriptions.get(REGISTER_CHANNEL).cloned().unwrap_or_default()
    };

    let body = Payload::Json(json!({
        "subscription": update.subscription,
        "service": update.service,
        "location": update.location,
        "timestamp": Utc::now().timestamp_millis(),
    }));
    for location in subscribers {
        if let Err(err) = deliver(app, REGISTER_CHANNEL, &location, &body).await {
            tracing::warn!(%location, error = %err, "cache-update delivery failed");
        }
    }

    notify_gateway_of_update(app, &update.service, &update.location).await;
}

/// POST a minimal "something changed" notification to the gateway, which
/// responds by pulling the full state.
pub async fn notify_gateway_of_update(app: &App, service: &str, location: &str) {
    let Some(gateway_url) = app.config.gateway_url.clone() else {
        return;
    };
    let pull_only = {
        let metadata = app.state.service_metadata.read().await;
        metadata
            .get(GATEWAY_SERVICE)
            .map(|m| m.pull_only)
            .unwrap_or(false)
    };
    if !pull_only {
        return;
    }

    let timestamp = Utc::now().timestamp_millis();
    let result = app
        .http
        .post(&gateway_url)
        .header(HEADER_REGISTRY_UPDATED, timestamp)
        .json(&json!({
            "service": service,
            "location": location,
            "timestamp": timestamp,
        }))
        .send()
        .await;

    match result {
        Ok(response) if !response.status().is_success() => {
            tracing::warn!(status = %response.status(), "gateway update notification rejected");
        }
        Ok(_) => tracing::debug!(service, location, "gateway notified of update"),
        Err(err) => tracing::warn!(error = %err, "gateway update notification failed"),
    }
}

/// Drop an endpoint from every channel it subscribes to; empty channels are
/// deleted. Used on unregister.
pub async fn remove_all_subscriptions_for_location(state: &RegistryState, location: &str) {
    let mut subscriptions = state.subscriptions.write().await;
    subscriptions.retain(|_, subscribers| {
        subscribers.retain(|existing| existing != location);
        !subscribers.is_empty()
    });
}
