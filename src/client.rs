//! Thin client helpers for talking to the registry: service calls, publish,
//! and the registration lifecycle used by the service-creation glue.

use bytes::Bytes;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{HttpError, Result};
use crate::protocol::{
    Command, Payload, HEADER_AUTH_TOKEN, HEADER_COMMAND, HEADER_PUBSUB_CHANNEL,
    HEADER_REGISTRY_TOKEN, HEADER_ROUTE_DATATYPE, HEADER_ROUTE_PATH, HEADER_SERVICE_HOME,
    HEADER_SERVICE_LOCATION, HEADER_SERVICE_NAME,
};
use crate::state::{RegistrySnapshot, ServiceMetadata};

/// Options for [`RegistryClient::call_service`].
#[derive(Debug, Default, Clone)]
pub struct CallOptions {
    pub content_type: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    registry_url: String,
    registry_token: Option<String>,
}

impl RegistryClient {
    pub fn new(registry_url: impl Into<String>, registry_token: Option<String>) -> RegistryClient {
        let http = reqwest::Client::builder()
            .user_agent(concat!("yamf/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        RegistryClient {
            http,
            registry_url: registry_url.into(),
            registry_token,
        }
    }

    pub fn from_config(config: &Config) -> Result<RegistryClient> {
        let registry_url = config
            .registry_url
            .clone()
            .ok_or_else(|| HttpError::Internal("YAMF_REGISTRY_URL is not configured".into()))?;
        Ok(RegistryClient::new(registry_url, config.registry_token.clone()))
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    fn command(&self, command: Command) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .post(&self.registry_url)
            .header(HEADER_COMMAND, command.as_str());
        if let Some(token) = &self.registry_token {
            request = request.header(HEADER_REGISTRY_TOKEN, token);
        }
        request
    }

    /// POST a payload to a named service through the registry and decode
    /// the reply by its content type.
    pub async fn call_service(
        &self,
        service: &str,
        payload: Payload,
        options: CallOptions,
    ) -> Result<Payload> {
        let mut request = self
            .command(Command::ServiceCall)
            .header(HEADER_SERVICE_NAME, service);
        if let Some(token) = &options.auth_token {
            request = request.header(HEADER_AUTH_TOKEN, token);
        }
        request = match payload {
            Payload::Json(value) => request.json(&value),
            Payload::Raw(bytes) => request
                .header(
                    reqwest::header::CONTENT_TYPE,
                    options
                        .content_type
                        .as_deref()
                        .unwrap_or("application/octet-stream"),
                )
                .body(bytes),
            Payload::Empty => request,
        };

        let response = request
            .send()
            .await
            .map_err(|err| HttpError::in_service(service, err.into()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(HttpError::in_service(
                service,
                HttpError::Status {
                    status: status.as_u16(),
                    message,
                },
            ));
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json") || ct.contains("+json"))
            .unwrap_or(false);
        if is_json {
            let value = response
                .json()
                .await
                .map_err(|err| HttpError::in_service(service, err.into()))?;
            Ok(Payload::Json(value))
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| HttpError::in_service(service, err.into()))?;
            Ok(Payload::Raw(Bytes::from(bytes)))
        }
    }

    /// Publish a message to a channel; returns the aggregated
    /// `{results, errors}` fan-out outcome.
    pub async fn publish(&self, channel: &str, message: &Value) -> Result<Value> {
        let response = self
            .command(Command::PubsubPublish)
            .header(HEADER_PUBSUB_CHANNEL, channel)
            .json(message)
            .send()
            .await?;
        expect_json(response).await
    }

    pub async fn setup_service(&self, service: &str, home: &str) -> Result<String> {
        let response = self
            .command(Command::ServiceSetup)
            .header(HEADER_SERVICE_NAME, service)
            .header(HEADER_SERVICE_HOME, home)
            .send()
            .await?;
        let value = expect_json(response).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| HttpError::Internal("setup reply carried no location".into()))
    }

    pub async fn register_service(
        &self,
        service: &str,
        location: &str,
        use_auth_service: Option<&str>,
        metadata: Option<&ServiceMetadata>,
    ) -> Result<Value> {
        let mut request = self
            .command(Command::ServiceRegister)
            .header(HEADER_SERVICE_NAME, service)
            .header(HEADER_SERVICE_LOCATION, location);

        let mut options = serde_json::Map::new();
        if let Some(auth_service) = use_auth_service {
            options.insert("useAuthService".into(), json!(auth_service));
        }
        if let Some(metadata) = metadata {
            options.insert(
                "metadata".into(),
                serde_json::to_value(metadata)
                    .map_err(|err| HttpError::Internal(format!("metadata encoding: {err}")))?,
            );
        }
        if !options.is_empty() {
            request = request.json(&Value::Object(options));
        }

        expect_json(request.send().await?).await
    }

    pub async fn unregister_service(&self, service: &str, location: &str) -> Result<Value> {
        let response = self
            .command(Command::ServiceUnregister)
            .header(HEADER_SERVICE_NAME, service)
            .header(HEADER_SERVICE_LOCATION, location)
            .send()
            .await?;
        expect_json(response).await
    }

    pub async fn lookup(&self, service: &str) -> Result<Value> {
        let response = self
            .command(Command::ServiceLookup)
            .header(HEADER_SERVICE_NAME, service)
            .send()
            .await?;
        expect_json(response).await
    }

    pub async fn register_route(
        &self,
        path: &str,
        service: &str,
        data_type: Option<&str>,
    ) -> Result<Value> {
        let mut request = self
            .command(Command::RouteRegister)
            .header(HEADER_ROUTE_PATH, path)
            .header(HEADER_SERVICE_NAME, service);
        if let Some(data_type) = data_type {
            request = request.header(HEADER_ROUTE_DATATYPE, data_type);
        }
        expect_json(request.send().await?).await
    }

    pub async fn subscribe(&self, channel: &str, service: &str, location: &str) -> Result<Value> {
        let response = self
            .command(Command::PubsubSubscribe)
            .header(HEADER_PUBSUB_CHANNEL, channel)
            .header(HEADER_SERVICE_NAME, service)
            .header(HEADER_SERVICE_LOCATION, location)
            .send()
            .await?;
        expect_json(response).await
    }

    pub async fn unsubscribe(&self, channel: &str, location: &str) -> Result<Value> {
        let response = self
            .command(Command::PubsubUnsubscribe)
            .header(HEADER_PUBSUB_CHANNEL, channel)
            .header(HEADER_SERVICE_LOCATION, location)
            .send()
            .await?;
        expect_json(response).await
    }

    /// Pull the full registry snapshot (the gateway's mirror refresh).
    pub async fn pull(&self) -> Result<RegistrySnapshot> {
        let response = self.command(Command::RegistryPull).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(HttpError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn health(&self) -> Result<Value> {
        let response = self
            .http
            .post(&self.registry_url)
            .header(HEADER_COMMAND, Command::Health.as_str())
            .send()
            .await?;
        expect_json(response).await
    }
}

async fn expect_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(HttpError::Status {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_requires_registry_url() {
        let config = Config::default();
        assert!(RegistryClient::from_config(&config).is_err());

        let config = Config {
            registry_url: Some("http://localhost:10000".into()),
            ..Config::default()
        };
        let client = RegistryClient::from_config(&config).unwrap();
        assert_eq!(client.registry_url(), "http://localhost:10000");
    }
}
