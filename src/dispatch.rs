//! The command router. Priority per request: header command, then route
//! match, then 404. Every error is caught here and mapped to a status.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::balancer::Strategy;
use crate::error::{error_response, HttpError, Result};
use crate::gateway;
use crate::protocol::{
    command_docs, Command, Payload, HEADER_PUBSUB_CHANNEL, HEADER_REGISTRY_TOKEN,
    HEADER_REGISTRY_UPDATED, HEADER_ROUTE_DATATYPE, HEADER_ROUTE_PATH, HEADER_SERVICE_HOME,
    HEADER_SERVICE_LOCATION, HEADER_SERVICE_NAME,
};
use crate::proxy;
use crate::pubsub;
use crate::routes;
use crate::server::{App, Role};
use crate::services;
use crate::state::ServiceMetadata;

/// Largest body the dispatcher itself will buffer (publish messages and
/// register metadata). Proxied bodies stream and are not limited here.
const MAX_COMMAND_BODY: usize = 10 * 1024 * 1024;

/// A handler either produced a value for the router to serialize, or it
/// already wrote the response (the streaming proxy).
enum Outcome {
    Value(Value),
    Handled(Response),
}

pub async fn dispatch(
    State(app): State<Arc<App>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match handle(&app, peer, request).await {
        Ok(Outcome::Value(value)) => Json(value).into_response(),
        Ok(Outcome::Handled(response)) => response,
        Err(err) => {
            match err.kind() {
                crate::error::ErrorKind::Client => {
                    tracing::debug!(%method, %path, error = %err, "request rejected")
                }
                crate::error::ErrorKind::Server => {
                    tracing::error!(%method, %path, error = %err.stack(), "request failed")
                }
            }
            error_response(&err, app.config.env().is_production_like())
        }
    }
}

async fn handle(app: &Arc<App>, peer: SocketAddr, request: Request) -> Result<Outcome> {
    // The registry-updated notification is recognized before anything else;
    // the payload is advisory and the gateway pulls instead of trusting it.
    if app.role == Role::Gateway && request.headers().contains_key(HEADER_REGISTRY_UPDATED) {
        gateway::spawn_refresh(app.clone());
        return Ok(Outcome::Value(json!({ "status": "ok" })));
    }

    match Command::from_headers(request.headers()) {
        Some(command) => {
            check_registry_token(app, command, request.headers())?;
            check_role(app, command)?;
            run_command(app, command, peer, request).await
        }
        None => {
            let path = request.uri().path().to_string();
            if request.method() == Method::GET
                && path == "/yamf/docs"
                && !app.config.env().is_production_like()
            {
                return Ok(Outcome::Value(json!({ "commands": command_docs() })));
            }
            match routes::match_route(&app.state, &path).await {
                Some(binding) => {
                    let response = proxy::proxy_to_service(
                        app,
                        &binding.service,
                        Some(&binding.data_type),
                        request,
                        peer,
                    )
                    .await?;
                    Ok(Outcome::Handled(response))
                }
                None => Err(HttpError::NotFound("Not found".into())),
            }
        }
    }
}

/// Protected commands require the configured registry token; with no token
/// configured every caller is accepted.
fn check_registry_token(app: &App, command: Command, headers: &HeaderMap) -> Result<()> {
    if !command.is_protected() {
        return Ok(());
    }
    let Some(expected) = app.config.registry_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(HEADER_REGISTRY_TOKEN)
        .and_then(|v| v.to_str().ok());
    if presented != Some(expected) {
        return Err(HttpError::Forbidden("Registry token required".into()));
    }
    Ok(())
}

/// Registrations always go to the registry; the gateway refuses commands
/// that would mutate its mirrored state.
fn check_role(app: &App, command: Command) -> Result<()> {
    if app.role == Role::Registry {
        return Ok(());
    }
    match command {
        Command::ServiceSetup
        | Command::ServiceRegister
        | Command::ServiceUnregister
        | Command::RouteRegister
        | Command::PubsubPublish
        | Command::PubsubSubscribe
        | Command::PubsubUnsubscribe => Err(HttpError::Forbidden(format!(
            "command {} must be sent to the registry",
            command.as_str()
        ))),
        _ => Ok(()),
    }
}

async fn run_command(
    app: &Arc<App>,
    command: Command,
    peer: SocketAddr,
    request: Request,
) -> Result<Outcome> {
    match command {
        Command::Health => Ok(Outcome::Value(health(app).await)),

        Command::RegistryPull => {
            let snapshot = app.state.snapshot().await;
            let value = serde_json::to_value(snapshot)
                .map_err(|err| HttpError::Internal(format!("snapshot serialization: {err}")))?;
            Ok(Outcome::Value(value))
        }

        Command::ServiceSetup => {
            let name = required_header(request.headers(), HEADER_SERVICE_NAME)?;
            let home = match optional_header(request.headers(), HEADER_SERVICE_HOME) {
                Some(home) => home,
                None => app.config.service_url.clone().ok_or_else(|| {
                    HttpError::BadRequest(format!("{HEADER_SERVICE_HOME} header is required"))
                })?,
            };
            services::setup(app, &name, &home).await.map(Outcome::Value)
        }

        Command::ServiceRegister => {
            let name = required_header(request.headers(), HEADER_SERVICE_NAME)?;
            let location = required_header(request.headers(), HEADER_SERVICE_LOCATION)?;
            let options = read_json_body(request).await?;
            let use_auth_service = options
                .as_ref()
                .and_then(|o| o.get("useAuthService"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let metadata = options
                .as_ref()
                .and_then(|o| o.get("metadata"))
                .map(|m| serde_json::from_value::<ServiceMetadata>(m.clone()))
                .transpose()
                .map_err(|err| HttpError::BadRequest(format!("invalid metadata: {err}")))?;
            services::register(app, &name, &location, use_auth_service.as_deref(), metadata)
                .await
                .map(Outcome::Value)
        }

        Command::ServiceUnregister => {
            let name = required_header(request.headers(), HEADER_SERVICE_NAME)?;
            let location = required_header(request.headers(), HEADER_SERVICE_LOCATION)?;
            services::unregister(app, &name, &location)
                .await
                .map(Outcome::Value)
        }

        Command::ServiceLookup => {
            let name = required_header(request.headers(), HEADER_SERVICE_NAME)?;
            services::lookup(app, &name, Strategy::Random)
                .await
                .map(Outcome::Value)
        }

        Command::ServiceCall => {
            let name = required_header(request.headers(), HEADER_SERVICE_NAME)?;
            let response = proxy::proxy_to_service(app, &name, None, request, peer).await?;
            Ok(Outcome::Handled(response))
        }

        Command::RouteRegister => {
            let path = required_header(request.headers(), HEADER_ROUTE_PATH)?;
            let service = required_header(request.headers(), HEADER_SERVICE_NAME)?;
            let data_type = optional_header(request.headers(), HEADER_ROUTE_DATATYPE);
            routes::register_route(&app.state, &path, &service, data_type.as_deref())
                .await
                .map(Outcome::Value)
        }

        Command::PubsubPublish => {
            let channel = required_header(request.headers(), HEADER_PUBSUB_CHANNEL)?;
            let payload = read_payload(request).await?;
            let outcome = pubsub::publish(app, &channel, &payload).await;
            let value = serde_json::to_value(outcome)
                .map_err(|err| HttpError::Internal(format!("publish serialization: {err}")))?;
            Ok(Outcome::Value(value))
        }

        Command::PubsubSubscribe => {
            let channel = required_header(request.headers(), HEADER_PUBSUB_CHANNEL)?;
            let service = required_header(request.headers(), HEADER_SERVICE_NAME)?;
            let location = required_header(request.headers(), HEADER_SERVICE_LOCATION)?;
            pubsub::subscribe(app, &channel, &service, &location)
                .await
                .map(Outcome::Value)
        }

        Command::PubsubUnsubscribe => {
            let channel = required_header(request.headers(), HEADER_PUBSUB_CHANNEL)?;
            let location = required_header(request.headers(), HEADER_SERVICE_LOCATION)?;
            pubsub::unsubscribe(&app.state, &channel, &location)
                .await
                .map(Outcome::Value)
        }

        Command::AuthLogin | Command::AuthRefresh => {
            let name = required_header(request.headers(), HEADER_SERVICE_NAME)?;
            let provider = resolve_auth_provider(app, &name).await?;
            let instance = app
                .balancer
                .pick(&app.state, &provider, Strategy::Random)
                .await?;
            let response = proxy::forward(app, &instance, None, request, peer).await?;
            Ok(Outcome::Handled(response))
        }

        Command::Unknown => Err(HttpError::BadRequest("unknown command".into())),
    }
}

async fn health(app: &App) -> Value {
    let mut health = json!({
        "status": "ready",
        "timestamp": Utc::now().timestamp_millis(),
        "environment": app.config.env().as_str(),
        "services": app.state.service_count().await,
    });
    if app.role == Role::Gateway {
        health["lastPull"] = match app.last_pull_millis() {
            Some(millis) => json!(millis),
            None => Value::Null,
        };
    }
    health
}

/// The auth provider recorded for a service, or the service itself when it
/// is an auth provider.
async fn resolve_auth_provider(app: &App, service: &str) -> Result<String> {
    if let Some(provider) = app.state.service_auth.read().await.get(service) {
        return Ok(provider.clone());
    }
    let is_auth = app
        .state
        .service_metadata
        .read()
        .await
        .get(service)
        .and_then(|m| m.service_type.as_deref().map(|t| t == "auth"))
        .unwrap_or(false);
    if is_auth {
        return Ok(service.to_string());
    }
    Err(HttpError::NotFound(format!(
        "no auth provider recorded for service \"{service}\""
    )))
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String> {
    optional_header(headers, name)
        .ok_or_else(|| HttpError::BadRequest(format!("{name} header is required")))
}

fn optional_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

/// Buffer and decode a command body per the plain-server rules.
async fn read_payload(request: Request) -> Result<Payload> {
    let method = request.method().clone();
    let content_type = optional_header(request.headers(), "content-type");
    let body = to_bytes(request.into_body(), MAX_COMMAND_BODY)
        .await
        .map_err(|err| HttpError::BadRequest(format!("failed to read body: {err}")))?;
    Ok(Payload::decode(&method, content_type.as_deref(), body))
}

async fn read_json_body(request: Request) -> Result<Option<Value>> {
    match read_payload(request).await? {
        Payload::Json(value) => Ok(Some(value)),
        Payload::Empty => Ok(None),
        Payload::Raw(_) => Err(HttpError::BadRequest(
            "expected a JSON body for this command".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::StatusCode;

    fn app_with_token(token: Option<&str>) -> App {
        App::new(
            Config {
                registry_token: token.map(str::to_string),
                ..Config::default()
            },
            Role::Registry,
        )
    }

    #[test]
    fn test_token_gate_accepts_when_unconfigured() {
        let app = app_with_token(None);
        let headers = HeaderMap::new();
        assert!(check_registry_token(&app, Command::ServiceSetup, &headers).is_ok());
    }

    #[test]
    fn test_token_gate_rejects_missing_token() {
        let app = app_with_token(Some("secret"));
        let headers = HeaderMap::new();
        let err = check_registry_token(&app, Command::ServiceSetup, &headers).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.to_string(), "Registry token required");
    }

    #[test]
    fn test_token_gate_rejects_mismatch() {
        let app = app_with_token(Some("secret"));
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_REGISTRY_TOKEN, "wrong".parse().unwrap());
        assert!(check_registry_token(&app, Command::RegistryPull, &headers).is_err());
    }

    #[test]
    fn test_token_gate_ignores_public_commands() {
        let app = app_with_token(Some("secret"));
        let headers = HeaderMap::new();
        assert!(check_registry_token(&app, Command::Health, &headers).is_ok());
        assert!(check_registry_token(&app, Command::ServiceCall, &headers).is_ok());
    }

    #[test]
    fn test_gateway_refuses_registrations() {
        let app = App::new(Config::default(), Role::Gateway);
        assert!(check_role(&app, Command::ServiceRegister).is_err());
        assert!(check_role(&app, Command::RouteRegister).is_err());
        assert!(check_role(&app, Command::PubsubSubscribe).is_err());
        assert!(check_role(&app, Command::ServiceCall).is_ok());
        assert!(check_role(&app, Command::Health).is_ok());
        assert!(check_role(&app, Command::RegistryPull).is_ok());
    }

    #[tokio::test]
    async fn test_resolve_auth_provider_prefers_mapping() {
        let app = app_with_token(None);
        app.state
            .service_auth
            .write()
            .await
            .insert("files".into(), "yamf-auth".into());
        assert_eq!(resolve_auth_provider(&app, "files").await.unwrap(), "yamf-auth");
    }

    #[tokio::test]
    async fn test_resolve_auth_provider_self_for_auth_services() {
        let app = app_with_token(None);
        app.state.service_metadata.write().await.insert(
            "yamf-auth".into(),
            ServiceMetadata {
                service_type: Some("auth".into()),
                ..ServiceMetadata::default()
            },
        );
        assert_eq!(
            resolve_auth_provider(&app, "yamf-auth").await.unwrap(),
            "yamf-auth"
        );
        assert!(resolve_auth_provider(&app, "ghost").await.is_err());
    }
}
