//! Service registry operations: port allocation, registration lifecycle,
//! lookup, and delegated auth verification.

use chrono::Utc;
use serde_json::{json, Value};

use crate::balancer::Strategy;
use crate::error::{HttpError, Result};
use crate::protocol::{GATEWAY_SERVICE, REGISTER_CHANNEL};
use crate::pubsub;
use crate::server::App;
use crate::state::ServiceMetadata;

/// Normalize a service home to `scheme://host`, dropping any port so that
/// `http://localhost` and `http://localhost:4000` share one counter.
pub fn normalize_home(home: &str) -> Result<String> {
    let url = reqwest::Url::parse(home)
        .map_err(|_| HttpError::BadRequest(format!("invalid service home: {home}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| HttpError::BadRequest(format!("service home has no host: {home}")))?;
    Ok(format!("{}://{}", url.scheme(), host))
}

/// Allocate the next port for a service home and return the full location.
/// Allocations are never reclaimed during the process lifetime.
pub async fn setup(app: &App, service: &str, home: &str) -> Result<Value> {
    if service.is_empty() {
        return Err(HttpError::BadRequest("service name must not be empty".into()));
    }
    let home = normalize_home(home)?;

    let location = {
        let mut domain_ports = app.state.domain_ports.write().await;
        let port = domain_ports
            .entry(home.clone())
            .or_insert(app.default_start_port);
        let allocated = *port;
        *port = port.checked_add(1).ok_or_else(|| {
            HttpError::Internal(format!("port space exhausted for {home}"))
        })?;
        format!("{home}:{allocated}")
    };

    tracing::info!(service, %location, "service port allocated");
    Ok(Value::String(location))
}

/// Register an instance endpoint under a service name, record its auth
/// provider and metadata, then announce the change: a `register` event to
/// current subscribers, a pull notification to the gateway, and an
/// auto-subscription of the new instance unless it is pull-only.
pub async fn register(
    app: &App,
    service: &str,
    location: &str,
    use_auth_service: Option<&str>,
    metadata: Option<ServiceMetadata>,
) -> Result<Value> {
    if service.is_empty() {
        return Err(HttpError::BadRequest("service name must not be empty".into()));
    }
    if location.is_empty() {
        return Err(HttpError::BadRequest(
            "service location must not be empty".into(),
        ));
    }

    let pull_only = metadata.as_ref().map(|m| m.pull_only).unwrap_or(false);

    {
        let mut services = app.state.services.write().await;
        let mut addresses = app.state.addresses.write().await;

        if let Some(owner) = addresses.get(location) {
            if owner != service {
                return Err(HttpError::Conflict(format!(
                    "location {location} is already registered to service \"{owner}\""
                )));
            }
        }

        let instances = services.entry(service.to_string()).or_default();
        if !instances.iter().any(|existing| existing == location) {
            instances.push(location.to_string());
        }
        addresses.insert(location.to_string(), service.to_string());

        if let Some(auth_service) = use_auth_service {
            app.state
                .service_auth
                .write()
                .await
                .insert(service.to_string(), auth_service.to_string());
        }
        if let Some(mut metadata) = metadata {
            metadata.registered_at = Some(Utc::now().timestamp_millis());
            app.state
                .service_metadata
                .write()
                .await
                .insert(service.to_string(), metadata);
        }
    }
    tracing::info!(service, location, "service registered");

    // State is visible to the router before anyone is told about it.
    pubsub::publish_cache_update(
        app,
        pubsub::CacheUpdate {
            subscription: REGISTER_CHANNEL.to_string(),
            service: service.to_string(),
            location: location.to_string(),
        },
    )
    .await;

    if !pull_only {
        pubsub::subscribe(app, REGISTER_CHANNEL, service, location).await?;
    }

    Ok(json!({
        "services": app.state.serialize_services().await,
        "addresses": app.state.serialize_addresses().await,
    }))
}

/// Remove an instance. When the service's last instance goes, the service
/// name, its auth mapping, and its metadata are dropped in the same critical
/// section. The endpoint also leaves every subscription set.
pub async fn unregister(app: &App, service: &str, location: &str) -> Result<Value> {
    {
        let mut services = app.state.services.write().await;
        let mut addresses = app.state.addresses.write().await;
        let mut service_auth = app.state.service_auth.write().await;
        let mut service_metadata = app.state.service_metadata.write().await;

        if let Some(instances) = services.get_mut(service) {
            instances.retain(|existing| existing != location);
            if instances.is_empty() {
                services.remove(service);
                service_auth.remove(service);
                service_metadata.remove(service);
            }
        }
        addresses.remove(location);
    }

    pubsub::remove_all_subscriptions_for_location(&app.state, location).await;
    tracing::info!(service, location, "service unregistered");

    pubsub::publish_cache_update(
        app,
        pubsub::CacheUpdate {
            subscription: "unregister".to_string(),
            service: service.to_string(),
            location: location.to_string(),
        },
    )
    .await;

    Ok(json!({ "service": service, "location": location }))
}

/// Look a service up: `*` returns the full serialized map, anything else
/// defers to the load balancer with the given strategy.
pub async fn lookup(app: &App, service: &str, strategy: Strategy) -> Result<Value> {
    if service.is_empty() {
        return Err(HttpError::BadRequest("service name must not be empty".into()));
    }
    if service == "*" {
        return Ok(app.state.serialize_services().await);
    }
    let address = app.balancer.pick(&app.state, service, strategy).await?;
    Ok(Value::String(address))
}

/// Gate a call to a service behind its recorded auth provider, if any. The
/// provider receives `{ "verifyAccess": token }`; unreachable means 503,
/// any error reply means 401.
pub async fn verify_access(app: &App, service: &str, auth_token: Option<&str>) -> Result<()> {
    let provider = {
        let service_auth = app.state.service_auth.read().await;
        service_auth.get(service).cloned()
    };
    let Some(provider) = provider else {
        return Ok(());
    };

    let Some(token) = auth_token else {
        return Err(HttpError::Unauthorized(format!(
            "service \"{service}\" requires an access token"
        )));
    };

    let provider_location = app.balancer.pick(&app.state, &provider, Strategy::Random).await?;
    let response = app
        .http
        .post(&provider_location)
        .json(&json!({ "verifyAccess": token }))
        .send()
        .await
        .map_err(|err| {
            tracing::warn!(%provider, error = %err, "auth provider unreachable");
            HttpError::Unavailable(format!("auth provider \"{provider}\" is unreachable"))
        })?;

    if !response.status().is_success() {
        return Err(HttpError::Unauthorized("access token rejected".into()));
    }
    let verdict: Value = response
        .json()
        .await
        .map_err(|_| HttpError::Unauthorized("access token rejected".into()))?;
    if verdict.get("error").is_some() {
        return Err(HttpError::Unauthorized("access token rejected".into()));
    }
    Ok(())
}

/// Pre-register the gateway as a pull-only service so cache updates reach
/// it through the pull protocol instead of push deliveries.
pub async fn preregister_gateway(app: &App) -> Result<()> {
    let Some(gateway_url) = app.config.gateway_url.clone() else {
        return Ok(());
    };
    register(
        app,
        GATEWAY_SERVICE,
        &gateway_url,
        None,
        Some(ServiceMetadata::gateway()),
    )
    .await?;
    tracing::info!(location = %gateway_url, "gateway pre-registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::{App, Role};

    fn test_app() -> App {
        App::new(
            Config {
                registry_url: Some("http://localhost:10000".into()),
                ..Config::default()
            },
            Role::Registry,
        )
    }

    #[test]
    fn test_normalize_home_strips_port() {
        assert_eq!(
            normalize_home("http://localhost:4000").unwrap(),
            "http://localhost"
        );
        assert_eq!(normalize_home("http://localhost").unwrap(), "http://localhost");
        assert_eq!(
            normalize_home("https://svc.internal:8443").unwrap(),
            "https://svc.internal"
        );
        assert!(normalize_home("not a url").is_err());
    }

    #[tokio::test]
    async fn test_setup_allocation_stream_ignores_port() {
        let app = test_app();
        let first = setup(&app, "echo", "http://localhost:4000").await.unwrap();
        let second = setup(&app, "echo", "http://localhost").await.unwrap();
        assert_eq!(first, json!("http://localhost:10001"));
        assert_eq!(second, json!("http://localhost:10002"));
    }

    #[tokio::test]
    async fn test_setup_separate_homes_get_separate_counters() {
        let app = test_app();
        let a = setup(&app, "a", "http://localhost").await.unwrap();
        let b = setup(&app, "b", "http://other-host").await.unwrap();
        assert_eq!(a, json!("http://localhost:10001"));
        assert_eq!(b, json!("http://other-host:10001"));
    }

    #[tokio::test]
    async fn test_setup_rejects_empty_name() {
        let app = test_app();
        assert!(setup(&app, "", "http://localhost").await.is_err());
    }

    #[tokio::test]
    async fn test_register_unregister_round_trip() {
        let app = test_app();
        register(&app, "echo", "http://localhost:10001", None, None)
            .await
            .unwrap();

        assert_eq!(
            app.state.addresses.read().await.get("http://localhost:10001"),
            Some(&"echo".to_string())
        );

        unregister(&app, "echo", "http://localhost:10001").await.unwrap();
        assert!(app.state.services.read().await.is_empty());
        assert!(app.state.addresses.read().await.is_empty());
        assert!(app.state.subscriptions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_register_is_idempotent_per_location() {
        let app = test_app();
        register(&app, "echo", "http://localhost:10001", None, None)
            .await
            .unwrap();
        register(&app, "echo", "http://localhost:10001", None, None)
            .await
            .unwrap();
        assert_eq!(app.state.services.read().await.get("echo").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_stolen_location() {
        let app = test_app();
        register(&app, "echo", "http://localhost:10001", None, None)
            .await
            .unwrap();
        let err = register(&app, "other", "http://localhost:10001", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_register_auto_subscribes_unless_pull_only() {
        let app = test_app();
        register(&app, "echo", "http://localhost:10001", None, None)
            .await
            .unwrap();
        assert!(app
            .state
            .subscriptions
            .read()
            .await
            .get(REGISTER_CHANNEL)
            .unwrap()
            .contains(&"http://localhost:10001".to_string()));

        register(
            &app,
            "mirror",
            "http://localhost:10002",
            None,
            Some(ServiceMetadata {
                pull_only: true,
                ..ServiceMetadata::default()
            }),
        )
        .await
        .unwrap();
        assert!(!app
            .state
            .subscriptions
            .read()
            .await
            .get(REGISTER_CHANNEL)
            .unwrap()
            .contains(&"http://localhost:10002".to_string()));
    }

    #[tokio::test]
    async fn test_last_instance_drops_auth_mapping_and_metadata() {
        let app = test_app();
        register(
            &app,
            "files",
            "http://localhost:10001",
            Some("yamf-auth"),
            Some(ServiceMetadata::default()),
        )
        .await
        .unwrap();
        register(&app, "files", "http://localhost:10002", None, None)
            .await
            .unwrap();

        unregister(&app, "files", "http://localhost:10001").await.unwrap();
        assert!(app.state.service_auth.read().await.contains_key("files"));

        unregister(&app, "files", "http://localhost:10002").await.unwrap();
        assert!(!app.state.service_auth.read().await.contains_key("files"));
        assert!(!app.state.service_metadata.read().await.contains_key("files"));
    }

    #[tokio::test]
    async fn test_lookup_star_returns_full_map() {
        let app = test_app();
        register(&app, "echo", "http://localhost:10001", None, None)
            .await
            .unwrap();
        let all = lookup(&app, "*", Strategy::Random).await.unwrap();
        assert_eq!(all["echo"][0], "http://localhost:10001");
    }

    #[tokio::test]
    async fn test_lookup_single_instance() {
        let app = test_app();
        register(&app, "echo", "http://localhost:10001", None, None)
            .await
            .unwrap();
        let found = lookup(&app, "echo", Strategy::Random).await.unwrap();
        assert_eq!(found, Value::String("http://localhost:10001".into()));
    }

    #[tokio::test]
    async fn test_lookup_unknown_service_is_404() {
        let app = test_app();
        let err = lookup(&app, "ghost", Strategy::Random).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_verify_access_without_provider_passes() {
        let app = test_app();
        register(&app, "echo", "http://localhost:10001", None, None)
            .await
            .unwrap();
        assert!(verify_access(&app, "echo", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_access_missing_token_is_401() {
        let app = test_app();
        app.state
            .service_auth
            .write()
            .await
            .insert("files".into(), "yamf-auth".into());
        let err = verify_access(&app, "files", None).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_preregister_gateway_metadata() {
        let app = App::new(
            Config {
                registry_url: Some("http://localhost:10000".into()),
                gateway_url: Some("http://localhost:9000".into()),
                ..Config::default()
            },
            Role::Registry,
        );
        preregister_gateway(&app).await.unwrap();

        let metadata = app.state.service_metadata.read().await;
        let gateway = metadata.get(GATEWAY_SERVICE).unwrap();
        assert!(gateway.pull_only);
        assert!(gateway.preregistered);
        assert_eq!(gateway.service_type.as_deref(), Some("gateway"));
        assert!(gateway.registered_at.is_some());

        // Pull-only: the gateway must not sit on the register channel.
        assert!(app.state.subscriptions.read().await.get(REGISTER_CHANNEL).is_none());
    }
}
