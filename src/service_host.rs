//! Service-creation glue: allocate a port through the registry, listen,
//! register, and dispatch requests to user handlers.
//!
//! Handlers receive the decoded payload, the request head, and a context
//! for calling other services or publishing. Returning [`Reply::Handled`]
//! means the handler wrote the response itself and the host adds nothing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::client::{CallOptions, RegistryClient};
use crate::config::Config;
use crate::content_type;
use crate::error::{error_response, HttpError, Result};
use crate::protocol::{Command, Payload, HEADER_PUBSUB_CHANNEL};
use crate::services::normalize_home;
use crate::state::ServiceMetadata;

const MAX_SERVICE_BODY: usize = 64 * 1024 * 1024;

/// What a handler hands back to the host.
#[derive(Debug)]
pub enum Reply {
    /// JSON-encoded with `application/json`.
    Value(Value),
    /// Content type inferred from the text and the request URL.
    Text(String),
    /// Raw bytes, `application/octet-stream`.
    Data(Bytes),
    /// The handler built the response itself (streaming, custom headers);
    /// the host must not write anything further.
    Handled(Response),
}

/// Handle to the registry carried into every handler invocation.
pub struct ServiceContext {
    pub name: String,
    pub location: String,
    client: RegistryClient,
}

impl ServiceContext {
    /// Call another service through the registry.
    pub async fn call(
        &self,
        service: &str,
        payload: Payload,
        options: CallOptions,
    ) -> Result<Payload> {
        self.client.call_service(service, payload, options).await
    }

    /// Publish a message on a channel through the registry.
    pub async fn publish(&self, channel: &str, message: &Value) -> Result<Value> {
        self.client.publish(channel, message).await
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Reply>> + Send>>;
type Handler = Arc<dyn Fn(Payload, Parts, Arc<ServiceContext>) -> HandlerFuture + Send + Sync>;

/// Builder for a hosted service. Paths are matched exactly; a `"*"` handler
/// catches everything else.
pub struct Service {
    name: String,
    handlers: HashMap<String, Handler>,
    subscriptions: HashMap<String, Handler>,
    use_auth_service: Option<String>,
    metadata: Option<ServiceMetadata>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Service {
        Service {
            name: name.into(),
            handlers: HashMap::new(),
            subscriptions: HashMap::new(),
            use_auth_service: None,
            metadata: None,
        }
    }

    pub fn handle<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Service
    where
        F: Fn(Payload, Parts, Arc<ServiceContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        self.handlers.insert(
            path.into(),
            Arc::new(move |payload, parts, ctx| Box::pin(handler(payload, parts, ctx))),
        );
        self
    }

    /// Attach a channel handler and subscribe this instance's endpoint once
    /// the service is registered. Delivery POSTs are recognized by their
    /// pubsub command and channel headers.
    pub fn create_subscription<F, Fut>(mut self, channel: impl Into<String>, handler: F) -> Service
    where
        F: Fn(Payload, Parts, Arc<ServiceContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        self.subscriptions.insert(
            channel.into(),
            Arc::new(move |payload, parts, ctx| Box::pin(handler(payload, parts, ctx))),
        );
        self
    }

    pub fn use_auth_service(mut self, provider: impl Into<String>) -> Service {
        self.use_auth_service = Some(provider.into());
        self
    }

    pub fn with_metadata(mut self, metadata: ServiceMetadata) -> Service {
        self.metadata = Some(metadata);
        self
    }

    /// Allocate a port, bind, register, subscribe. The returned handle owns
    /// the socket until [`ServiceHandle::terminate`].
    pub async fn start(self, config: &Config) -> anyhow::Result<ServiceHandle> {
        let client = RegistryClient::from_config(config)?;

        let home = match &config.service_url {
            Some(service_url) => normalize_home(service_url)?,
            None => normalize_home(client.registry_url())?,
        };
        let location = client.setup_service(&self.name, &home).await?;
        let port = reqwest::Url::parse(&location)
            .ok()
            .and_then(|url| url.port())
            .ok_or_else(|| anyhow::anyhow!("allocated location has no port: {location}"))?;

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;

        let inner = Arc::new(HostInner {
            ctx: Arc::new(ServiceContext {
                name: self.name.clone(),
                location: location.clone(),
                client: client.clone(),
            }),
            handlers: self.handlers,
            subscriptions: self.subscriptions,
            redact: config.env().is_production_like(),
        });

        let router = axum::Router::new()
            .fallback(host_dispatch)
            .layer(middleware::from_fn(host_security_headers))
            .layer(TraceLayer::new_for_http())
            .with_state(inner.clone());

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(err) = result {
                tracing::error!(error = %err, "service loop failed");
            }
        });

        client
            .register_service(
                &self.name,
                &location,
                self.use_auth_service.as_deref(),
                self.metadata.as_ref(),
            )
            .await?;
        for channel in inner.subscriptions.keys() {
            client.subscribe(channel, &self.name, &location).await?;
        }
        tracing::info!(service = %self.name, %location, "service started");

        Ok(ServiceHandle {
            name: self.name,
            location,
            client,
            cancel,
            task,
        })
    }
}

/// A running hosted service. Terminate unregisters before the socket stops.
pub struct ServiceHandle {
    pub name: String,
    pub location: String,
    client: RegistryClient,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    pub async fn terminate(self) -> Result<()> {
        self.client
            .unregister_service(&self.name, &self.location)
            .await?;
        self.cancel.cancel();
        let _ = self.task.await;
        Ok(())
    }
}

struct HostInner {
    ctx: Arc<ServiceContext>,
    handlers: HashMap<String, Handler>,
    subscriptions: HashMap<String, Handler>,
    redact: bool,
}

async fn host_dispatch(State(inner): State<Arc<HostInner>>, request: Request) -> Response {
    match run_handler(&inner, request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(service = %inner.ctx.name, error = %err, "handler failed");
            error_response(&err, inner.redact)
        }
    }
}

async fn run_handler(inner: &HostInner, request: Request) -> Result<Response> {
    let handler = select_handler(inner, &request)?;

    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_SERVICE_BODY)
        .await
        .map_err(|err| HttpError::BadRequest(format!("failed to read body: {err}")))?;
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let payload = Payload::decode(&parts.method, content_type.as_deref(), bytes);

    let path = parts.uri.path().to_string();
    let reply = handler(payload, parts, inner.ctx.clone()).await?;
    Ok(render_reply(reply, &path))
}

fn select_handler<'a>(inner: &'a HostInner, request: &Request) -> Result<&'a Handler> {
    if Command::from_headers(request.headers()) == Some(Command::PubsubPublish) {
        if let Some(channel) = request
            .headers()
            .get(HEADER_PUBSUB_CHANNEL)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(handler) = inner.subscriptions.get(channel) {
                return Ok(handler);
            }
        }
    }
    inner
        .handlers
        .get(request.uri().path())
        .or_else(|| inner.handlers.get("*"))
        .ok_or_else(|| HttpError::NotFound("Not found".into()))
}

fn render_reply(reply: Reply, path: &str) -> Response {
    match reply {
        Reply::Value(value) => Json(value).into_response(),
        Reply::Text(text) => {
            let mime = content_type::infer_for_text(&text, Some(path));
            let mut response = (StatusCode::OK, text).into_response();
            if let Ok(value) = HeaderValue::from_str(&mime) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            response
        }
        Reply::Data(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Body::from(bytes),
        )
            .into_response(),
        Reply::Handled(response) => response,
    }
}

async fn host_security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "x-xss-protection",
        HeaderValue::from_static("1; mode=block"),
    );
    response
}
