//! The header-based command scheme every internal operation travels over.
//!
//! Header names and command strings are part of the wire contract; the
//! parser here is the only place command strings are compared.

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use serde::Serialize;

pub const HEADER_COMMAND: &str = "yamf-command";
pub const HEADER_SERVICE_NAME: &str = "yamf-service-name";
pub const HEADER_SERVICE_LOCATION: &str = "yamf-service-location";
pub const HEADER_SERVICE_HOME: &str = "yamf-service-home";
pub const HEADER_ROUTE_PATH: &str = "yamf-route-path";
pub const HEADER_ROUTE_DATATYPE: &str = "yamf-route-datatype";
pub const HEADER_ROUTE_TYPE: &str = "yamf-route-type";
pub const HEADER_PUBSUB_CHANNEL: &str = "yamf-pubsub-channel";
pub const HEADER_AUTH_TOKEN: &str = "yamf-auth-token";
pub const HEADER_REGISTRY_TOKEN: &str = "yamf-registry-token";
/// Marks the registry→gateway "something changed" notification.
pub const HEADER_REGISTRY_UPDATED: &str = "yamf-registry-updated";

/// The service name the registry pre-registers the gateway under.
pub const GATEWAY_SERVICE: &str = "yamf-gateway";
/// The internal channel carrying registry cache-update events.
pub const REGISTER_CHANNEL: &str = "register";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Health,
    RegistryPull,
    ServiceSetup,
    ServiceRegister,
    ServiceUnregister,
    ServiceLookup,
    ServiceCall,
    RouteRegister,
    PubsubPublish,
    PubsubSubscribe,
    PubsubUnsubscribe,
    AuthLogin,
    AuthRefresh,
    Unknown,
}

impl Command {
    pub const ALL: [Command; 13] = [
        Command::Health,
        Command::RegistryPull,
        Command::ServiceSetup,
        Command::ServiceRegister,
        Command::ServiceUnregister,
        Command::ServiceLookup,
        Command::ServiceCall,
        Command::RouteRegister,
        Command::PubsubPublish,
        Command::PubsubSubscribe,
        Command::PubsubUnsubscribe,
        Command::AuthLogin,
        Command::AuthRefresh,
    ];

    pub fn parse(raw: &str) -> Command {
        match raw.to_ascii_lowercase().as_str() {
            "health" => Command::Health,
            "registry-pull" => Command::RegistryPull,
            "service-setup" => Command::ServiceSetup,
            "service-register" => Command::ServiceRegister,
            "service-unregister" => Command::ServiceUnregister,
            "service-lookup" => Command::ServiceLookup,
            "service-call" => Command::ServiceCall,
            "route-register" => Command::RouteRegister,
            "pubsub-publish" => Command::PubsubPublish,
            "pubsub-subscribe" => Command::PubsubSubscribe,
            "pubsub-unsubscribe" => Command::PubsubUnsubscribe,
            "auth-login" => Command::AuthLogin,
            "auth-refresh" => Command::AuthRefresh,
            _ => Command::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Health => "health",
            Command::RegistryPull => "registry-pull",
            Command::ServiceSetup => "service-setup",
            Command::ServiceRegister => "service-register",
            Command::ServiceUnregister => "service-unregister",
            Command::ServiceLookup => "service-lookup",
            Command::ServiceCall => "service-call",
            Command::RouteRegister => "route-register",
            Command::PubsubPublish => "pubsub-publish",
            Command::PubsubSubscribe => "pubsub-subscribe",
            Command::PubsubUnsubscribe => "pubsub-unsubscribe",
            Command::AuthLogin => "auth-login",
            Command::AuthRefresh => "auth-refresh",
            Command::Unknown => "unknown",
        }
    }

    /// Protected commands mutate registry state or reveal it wholesale and
    /// require the shared registry token when one is configured.
    pub fn is_protected(&self) -> bool {
        matches!(
            self,
            Command::ServiceSetup
                | Command::ServiceRegister
                | Command::ServiceUnregister
                | Command::RouteRegister
                | Command::PubsubPublish
                | Command::PubsubSubscribe
                | Command::PubsubUnsubscribe
                | Command::RegistryPull
        )
    }

    /// Extract and parse the command header, if any.
    pub fn from_headers(headers: &HeaderMap) -> Option<Command> {
        headers
            .get(HEADER_COMMAND)
            .and_then(|v| v.to_str().ok())
            .map(Command::parse)
    }
}

/// A request or message body at the framework boundary: structured JSON, raw
/// bytes preserved exactly, or nothing. Never conflated with strings.
#[derive(Debug, Clone)]
pub enum Payload {
    Json(serde_json::Value),
    Raw(Bytes),
    Empty,
}

impl Payload {
    /// Decode a buffered body the way the plain server does: bodyless
    /// methods stay empty, JSON content types are parsed, and binary
    /// content types are never JSON-parsed.
    pub fn decode(method: &Method, content_type: Option<&str>, body: Bytes) -> Payload {
        if matches!(
            *method,
            Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS
        ) || body.is_empty()
        {
            return Payload::Empty;
        }
        if is_json_content_type(content_type) {
            if let Ok(value) = serde_json::from_slice(&body) {
                return Payload::Json(value);
            }
        }
        Payload::Raw(body)
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

fn is_json_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("application/json") || ct.contains("+json")
        })
        .unwrap_or(false)
}

/// One line of the docs listing: a command, whether it is protected, and the
/// headers it reads.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDoc {
    pub command: &'static str,
    pub protected: bool,
    pub headers: Vec<&'static str>,
}

pub fn command_docs() -> Vec<CommandDoc> {
    Command::ALL
        .iter()
        .map(|cmd| CommandDoc {
            command: cmd.as_str(),
            protected: cmd.is_protected(),
            headers: match cmd {
                Command::Health | Command::RegistryPull => vec![HEADER_COMMAND],
                Command::ServiceSetup => {
                    vec![HEADER_COMMAND, HEADER_SERVICE_NAME, HEADER_SERVICE_HOME]
                }
                Command::ServiceRegister | Command::ServiceUnregister => {
                    vec![HEADER_COMMAND, HEADER_SERVICE_NAME, HEADER_SERVICE_LOCATION]
                }
                Command::ServiceLookup => vec![HEADER_COMMAND, HEADER_SERVICE_NAME],
                Command::ServiceCall => {
                    vec![HEADER_COMMAND, HEADER_SERVICE_NAME, HEADER_AUTH_TOKEN]
                }
                Command::RouteRegister => vec![
                    HEADER_COMMAND,
                    HEADER_ROUTE_PATH,
                    HEADER_SERVICE_NAME,
                    HEADER_ROUTE_DATATYPE,
                    HEADER_ROUTE_TYPE,
                ],
                Command::PubsubPublish => vec![HEADER_COMMAND, HEADER_PUBSUB_CHANNEL],
                Command::PubsubSubscribe => vec![
                    HEADER_COMMAND,
                    HEADER_PUBSUB_CHANNEL,
                    HEADER_SERVICE_NAME,
                    HEADER_SERVICE_LOCATION,
                ],
                Command::PubsubUnsubscribe => {
                    vec![HEADER_COMMAND, HEADER_PUBSUB_CHANNEL, HEADER_SERVICE_LOCATION]
                }
                Command::AuthLogin | Command::AuthRefresh => {
                    vec![HEADER_COMMAND, HEADER_SERVICE_NAME]
                }
                Command::Unknown => vec![],
            },
        })
        .collect()
}
