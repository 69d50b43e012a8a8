//! Streaming request proxy: pipes bodies between client and service without
//! buffering, rewrites forwarding metadata, and enforces the auth gate.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use futures::{SinkExt, StreamExt};

use crate::balancer::Strategy;
use crate::error::{HttpError, Result};
use crate::protocol::{HEADER_AUTH_TOKEN, HEADER_COMMAND, HEADER_REGISTRY_TOKEN, HEADER_SERVICE_NAME};
use crate::server::App;
use crate::services;

/// Inbound headers forwarded to the downstream service. Everything else is
/// dropped. This set is a security boundary: additions require review.
const FORWARDABLE: [&str; 16] = [
    "accept",
    "accept-language",
    "connection",
    "content-type",
    "origin",
    "referer",
    "forwarded",
    "user-agent",
    "range",
    "if-range",
    "accept-ranges",
    "cookie",
    HEADER_COMMAND,
    HEADER_SERVICE_NAME,
    HEADER_AUTH_TOKEN,
    HEADER_REGISTRY_TOKEN,
];

fn is_forwardable(name: &str) -> bool {
    FORWARDABLE.contains(&name)
        || name.starts_with("sec-fetch-")
        || name.starts_with("sec-ch-ua")
}

/// Hop-by-hop response headers that must not be relayed verbatim; the
/// client connection negotiates its own.
const HOP_BY_HOP: [&str; 5] = [
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "trailer",
];

/// Proxy a request to one instance of `service`: existence check, auth
/// verification, round-robin pick, then a straight pipe.
pub async fn proxy_to_service(
    app: &App,
    service: &str,
    default_content_type: Option<&str>,
    request: Request,
    peer: SocketAddr,
) -> Result<Response> {
    let auth_token = request
        .headers()
        .get(HEADER_AUTH_TOKEN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // get_addresses doubles as the existence check (404 on unknown name).
    app.balancer.get_addresses(&app.state, service).await?;
    services::verify_access(app, service, auth_token.as_deref()).await?;

    let instance = app
        .balancer
        .pick(&app.state, service, Strategy::RoundRobin)
        .await?;
    forward(app, &instance, default_content_type, request, peer).await
}

/// Pipe a request to a concrete instance location and stream the response
/// back. The inbound path and query are appended to the instance base URL.
pub async fn forward(
    app: &App,
    instance: &str,
    default_content_type: Option<&str>,
    request: Request,
    peer: SocketAddr,
) -> Result<Response> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("{}{}", instance.trim_end_matches('/'), path_and_query);
    let target_url = reqwest::Url::parse(&target)
        .map_err(|_| HttpError::BadGateway(format!("invalid downstream target: {target}")))?;

    let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
        .map_err(|_| HttpError::BadRequest("unsupported method".into()))?;

    let headers = downstream_headers(request.headers(), peer, app.advertised_host(), "http");

    let mut builder = app
        .http
        .request(method, target_url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(pipe_body(request)));
    if let Some(secs) = app.config.proxy_timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    // Connect/DNS failures happen before any response bytes have flown, so
    // a clean 502 is still possible. Later stream errors close the pipe.
    let downstream = builder.send().await.map_err(|err| {
        tracing::warn!(instance, error = %err, "downstream request failed");
        HttpError::BadGateway(format!("downstream connect failed: {err}"))
    })?;

    let mut response = Response::builder().status(
        StatusCode::from_u16(downstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY),
    );
    if let Some(response_headers) = response.headers_mut() {
        for (name, value) in downstream.headers() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.append(name, value);
            }
        }
        if !response_headers.contains_key("content-type") {
            if let Some(data_type) = default_content_type.filter(|dt| *dt != "dynamic") {
                if let Ok(value) = HeaderValue::from_str(data_type) {
                    response_headers.insert("content-type", value);
                }
            }
        }
    }

    response
        .body(Body::from_stream(downstream.bytes_stream()))
        .map_err(|err| HttpError::Internal(format!("response assembly failed: {err}")))
}

/// Relay the inbound body chunk by chunk. A read error tears down the
/// downstream request; a closed downstream stops the reader.
fn pipe_body(
    request: Request,
) -> futures::channel::mpsc::Receiver<std::result::Result<bytes::Bytes, std::io::Error>> {
    let (mut tx, rx) = futures::channel::mpsc::channel(16);
    let mut inbound = request.into_body().into_data_stream();
    tokio::spawn(async move {
        while let Some(chunk) = inbound.next().await {
            let chunk = chunk
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::BrokenPipe, err));
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });
    rx
}

/// Copy the whitelisted inbound headers into a downstream header map and
/// graft on the rewritten forwarding metadata. `Host` is never copied; the
/// client sets it from the target URL.
fn downstream_headers(
    inbound: &HeaderMap,
    peer: SocketAddr,
    by: &str,
    proto: &str,
) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in inbound {
        let name_str = name.as_str();
        if !is_forwardable(name_str) || name_str == "forwarded" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name_str.as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    let rewritten = rewrite_forwarded(&ForwardContext {
        forwarded: header_str(inbound, "forwarded"),
        x_forwarded_for: header_str(inbound, "x-forwarded-for"),
        host: header_str(inbound, "host"),
        peer: peer.ip(),
        by,
        proto,
    });
    set_header(&mut headers, "forwarded", &rewritten.forwarded);
    set_header(&mut headers, "x-forwarded-for", &rewritten.x_forwarded_for);
    set_header(&mut headers, "x-forwarded-proto", &rewritten.x_forwarded_proto);
    if let Some(host) = &rewritten.x_forwarded_host {
        set_header(&mut headers, "x-forwarded-host", host);
    }
    headers
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn set_header(headers: &mut reqwest::header::HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = reqwest::header::HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Inputs to the forwarding-metadata rewrite.
pub struct ForwardContext<'a> {
    pub forwarded: Option<&'a str>,
    pub x_forwarded_for: Option<&'a str>,
    pub host: Option<&'a str>,
    pub peer: IpAddr,
    /// This hop's identity, appended to the `by` chain.
    pub by: &'a str,
    pub proto: &'a str,
}

#[derive(Debug, PartialEq)]
pub struct ForwardHeaders {
    pub forwarded: String,
    pub x_forwarded_for: String,
    pub x_forwarded_host: Option<String>,
    pub x_forwarded_proto: String,
}

/// Build the outgoing `Forwarded` and legacy `X-Forwarded-*` headers. The
/// original sender comes from the inbound `Forwarded` header when present,
/// else from `X-Forwarded-For`, else from the socket peer. IPv6 addresses
/// are bracketed, and this hop joins the `by` chain.
pub fn rewrite_forwarded(ctx: &ForwardContext) -> ForwardHeaders {
    let peer = format_addr(ctx.peer);

    let client = ctx
        .forwarded
        .and_then(first_forwarded_param("for"))
        .or_else(|| {
            ctx.x_forwarded_for
                .and_then(|xff| xff.split(',').next())
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
        })
        .unwrap_or_else(|| peer.clone());

    let by_chain = match ctx.forwarded.and_then(first_forwarded_param("by")) {
        Some(prior) => format!("{prior}, {}", ctx.by),
        None => ctx.by.to_string(),
    };

    let mut forwarded = format!(
        "for={}; by={}",
        quote_token(&client),
        quote_token(&by_chain)
    );
    if let Some(host) = ctx.host {
        forwarded.push_str(&format!("; host={host}"));
    }
    forwarded.push_str(&format!("; proto={}", ctx.proto));

    let x_forwarded_for = match ctx.x_forwarded_for {
        Some(existing) if !existing.is_empty() => format!("{existing}, {peer}"),
        _ => peer,
    };

    ForwardHeaders {
        forwarded,
        x_forwarded_for,
        x_forwarded_host: ctx.host.map(str::to_string),
        x_forwarded_proto: ctx.proto.to_string(),
    }
}

fn format_addr(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Extract a parameter from the first (original-sender) element of a
/// `Forwarded` header.
fn first_forwarded_param(key: &'static str) -> impl Fn(&str) -> Option<String> {
    move |forwarded| {
        let first_hop = forwarded.split(',').next()?;
        first_hop.split(';').find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            if name.trim().eq_ignore_ascii_case(key) {
                let value = value.trim().trim_matches('"');
                (!value.is_empty()).then(|| value.to_string())
            } else {
                None
            }
        })
    }
}

/// RFC 7239 tokens with separators (bracketed IPv6, chained hops) must be
/// quoted.
fn quote_token(token: &str) -> String {
    if token.contains([':', ',', '[']) {
        format!("\"{token}\"")
    } else {
        token.to_string()
    }
}
