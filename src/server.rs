//! Process assembly: the shared [`App`] context, the middleware stack both
//! servers share, and the registry bootstrap/termination sequence.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::balancer::LoadBalancer;
use crate::config::Config;
use crate::dispatch;
use crate::services;
use crate::state::RegistryState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Registry,
    Gateway,
}

/// Everything a dispatcher needs, shared across requests. One per process.
pub struct App {
    pub config: Config,
    pub role: Role,
    pub state: RegistryState,
    pub balancer: LoadBalancer,
    pub http: reqwest::Client,
    pub default_start_port: u16,
    /// This hop's `host:port` identity for forwarding metadata.
    advertised: String,
    /// Millis of the gateway's most recent successful pull; 0 means never.
    last_pull: AtomicI64,
}

impl App {
    pub fn new(config: Config, role: Role) -> App {
        // Connects are bounded; established streams are not.
        let http = reqwest::Client::builder()
            .user_agent(concat!("yamf/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        let own_url = match role {
            Role::Registry => config.registry_url.as_deref(),
            Role::Gateway => config.gateway_url.as_deref(),
        };
        let advertised = own_url
            .and_then(|url| reqwest::Url::parse(url).ok())
            .and_then(|url| {
                let host = url.host_str()?.to_string();
                Some(match url.port_or_known_default() {
                    Some(port) => format!("{host}:{port}"),
                    None => host,
                })
            })
            .unwrap_or_else(|| "localhost".to_string());

        App {
            default_start_port: config.default_start_port(),
            config,
            role,
            state: RegistryState::new(),
            balancer: LoadBalancer::new(),
            http,
            advertised,
            last_pull: AtomicI64::new(0),
        }
    }

    pub fn advertised_host(&self) -> &str {
        &self.advertised
    }

    pub fn set_last_pull(&self, millis: i64) {
        self.last_pull.store(millis, Ordering::Relaxed);
    }

    pub fn last_pull_millis(&self) -> Option<i64> {
        match self.last_pull.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(millis),
        }
    }
}

/// The dispatcher plus the middleware stack shared by registry and gateway:
/// request tracing, the total-request timeout, panic containment (both
/// processes must survive bad calls), and the security response headers.
pub fn build_router(app: Arc<App>) -> Router {
    let timeout = Duration::from_secs(app.config.request_timeout_secs);
    Router::new()
        .fallback(dispatch::dispatch)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(timeout))
                .layer(CatchPanicLayer::new())
                .layer(middleware::from_fn(security_headers)),
        )
        .with_state(app)
}

async fn security_headers(request: Request, next: Next) -> Response {
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

/// A running registry or gateway process. Termination reverses startup:
/// stop accepting, then clear state.
pub struct ServerHandle {
    pub app: Arc<App>,
    pub addr: SocketAddr,
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn url(&self) -> String {
        if self.addr.ip().is_unspecified() {
            format!("http://127.0.0.1:{}", self.addr.port())
        } else {
            format!("http://{}", self.addr)
        }
    }

    pub async fn terminate(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "server task ended abnormally");
        }
        self.app.state.reset().await;
    }
}

pub(crate) fn serve(app: Arc<App>, listener: TcpListener) -> (CancellationToken, JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let router = build_router(app);

    let task = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
        if let Err(err) = result {
            tracing::error!(error = %err, "server loop failed");
        }
    });

    (cancel, task)
}

/// Boot the registry: validate the environment, bind, pre-register the
/// gateway, and start dispatching.
pub async fn start_registry(
    mut config: Config,
    port_override: Option<u16>,
) -> anyhow::Result<ServerHandle> {
    config.validate_for_registry()?;

    let port = match port_override {
        Some(port) => port,
        None => config
            .registry_port()
            .ok_or_else(|| anyhow::anyhow!("YAMF_REGISTRY_URL with a port is required"))?,
    };
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    if config.registry_url.is_none() || port_override == Some(0) {
        config.registry_url = Some(format!("http://127.0.0.1:{}", addr.port()));
    }

    if let Some(fingerprint) = config.token_fingerprint() {
        tracing::info!(token = %fingerprint, "registry token configured");
    }

    let app = Arc::new(App::new(config, Role::Registry));
    services::preregister_gateway(&app).await?;

    let (cancel, task) = serve(app.clone(), listener);
    tracing::info!(%addr, start_port = app.default_start_port, "registry listening");

    Ok(ServerHandle {
        app,
        addr,
        cancel,
        task,
    })
}

/// Wire up tracing the same way for every binary. `LOG_INCLUDE_LINES`
/// switches on file/line detail.
pub fn init_tracing(config: &Config) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yamf=debug,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(config.log_include_lines)
                .with_line_number(config.log_include_lines),
        )
        .init();
}
