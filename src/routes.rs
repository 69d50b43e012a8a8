//! Route table operations: exact paths and wildcard controller prefixes.

use serde_json::{json, Value};

use crate::error::{HttpError, Result};
use crate::state::{RegistryState, RouteBinding};

pub const DEFAULT_DATA_TYPE: &str = "dynamic";

/// Bind a path to a service. Paths ending in `*` become controller routes,
/// stored with the wildcard stripped as a prefix key. Re-registering a path
/// overwrites the prior binding.
pub async fn register_route(
    state: &RegistryState,
    path: &str,
    service: &str,
    data_type: Option<&str>,
) -> Result<Value> {
    if path.is_empty() {
        return Err(HttpError::BadRequest("route path must not be empty".into()));
    }
    if service.is_empty() {
        return Err(HttpError::BadRequest("service name must not be empty".into()));
    }

    let binding = RouteBinding {
        service: service.to_string(),
        data_type: data_type.unwrap_or(DEFAULT_DATA_TYPE).to_string(),
    };

    if let Some(prefix) = path.strip_suffix('*') {
        if prefix.is_empty() {
            return Err(HttpError::BadRequest(
                "controller route must have a prefix before \"*\"".into(),
            ));
        }
        state
            .controller_routes
            .write()
            .await
            .insert(prefix.to_string(), binding.clone());
        tracing::info!(path = prefix, service, "controller route registered");
    } else {
        state
            .routes
            .write()
            .await
            .insert(path.to_string(), binding.clone());
        tracing::info!(path, service, "route registered");
    }

    Ok(json!({ "path": path, "service": binding.service, "dataType": binding.data_type }))
}

/// Resolve a request path: exact match first, then the first controller
/// prefix matching case-insensitively.
pub async fn match_route(state: &RegistryState, path: &str) -> Option<RouteBinding> {
    if let Some(binding) = state.routes.read().await.get(path) {
        return Some(binding.clone());
    }
    let lowered = path.to_ascii_lowercase();
    let controllers = state.controller_routes.read().await;
    controllers
        .iter()
        .find(|(prefix, _)| lowered.starts_with(&prefix.to_ascii_lowercase()))
        .map(|(_, binding)| binding.clone())
}

/// Remove a binding by its exact registration key (wildcard included).
pub async fn remove_route(state: &RegistryState, path: &str) -> bool {
    if let Some(prefix) = path.strip_suffix('*') {
        state.controller_routes.write().await.remove(prefix).is_some()
    } else {
        state.routes.write().await.remove(path).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_direct_route_match() {
        let state = RegistryState::new();
        register_route(&state, "/echo", "echo", None).await.unwrap();

        let binding = match_route(&state, "/echo").await.unwrap();
        assert_eq!(binding.service, "echo");
        assert_eq!(binding.data_type, "dynamic");
        assert!(match_route(&state, "/echo/extra").await.is_none());
    }

    #[tokio::test]
    async fn test_controller_route_prefix_match() {
        let state = RegistryState::new();
        register_route(&state, "/files/*", "static", Some("text/html"))
            .await
            .unwrap();

        assert_eq!(
            match_route(&state, "/files/css/site.css").await.unwrap().service,
            "static"
        );
        assert_eq!(match_route(&state, "/files/").await.unwrap().service, "static");
        assert!(match_route(&state, "/file").await.is_none());
    }

    #[tokio::test]
    async fn test_prefix_match_is_case_insensitive() {
        let state = RegistryState::new();
        register_route(&state, "/Files/*", "static", None).await.unwrap();
        assert!(match_route(&state, "/files/a.txt").await.is_some());
        assert!(match_route(&state, "/FILES/a.txt").await.is_some());
    }

    #[tokio::test]
    async fn test_exact_match_wins_over_controller() {
        let state = RegistryState::new();
        register_route(&state, "/api/*", "old", None).await.unwrap();
        register_route(&state, "/api/users", "users", None).await.unwrap();

        assert_eq!(match_route(&state, "/api/users").await.unwrap().service, "users");
        assert_eq!(match_route(&state, "/api/other").await.unwrap().service, "old");
    }

    #[tokio::test]
    async fn test_duplicate_registration_overwrites() {
        let state = RegistryState::new();
        register_route(&state, "/echo", "first", None).await.unwrap();
        register_route(&state, "/echo", "second", None).await.unwrap();
        assert_eq!(match_route(&state, "/echo").await.unwrap().service, "second");
    }

    #[tokio::test]
    async fn test_remove_by_exact_key() {
        let state = RegistryState::new();
        register_route(&state, "/files/*", "static", None).await.unwrap();
        register_route(&state, "/echo", "echo", None).await.unwrap();

        assert!(remove_route(&state, "/files/*").await);
        assert!(remove_route(&state, "/echo").await);
        assert!(!remove_route(&state, "/echo").await);
        assert!(match_route(&state, "/files/x").await.is_none());
    }

    #[tokio::test]
    async fn test_empty_path_rejected() {
        let state = RegistryState::new();
        assert!(register_route(&state, "", "echo", None).await.is_err());
        assert!(register_route(&state, "*", "echo", None).await.is_err());
        assert!(register_route(&state, "/echo", "", None).await.is_err());
    }
}
