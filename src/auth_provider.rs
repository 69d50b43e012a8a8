//! The bundled auth provider: a hosted service issuing and verifying HS256
//! tokens against the configured admin credentials. Other services opt in
//! by registering with `useAuthService: "yamf-auth"`.

use axum::http::header;
use axum::http::request::Parts;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Config;
use crate::error::{HttpError, Result};
use crate::protocol::Payload;
use crate::service_host::{Reply, Service, ServiceHandle};
use crate::state::ServiceMetadata;

pub const SERVICE_NAME: &str = "yamf-auth";

const ACCESS_TTL_SECS: i64 = 15 * 60;
const REFRESH_TTL_SECS: i64 = 12 * 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
    kind: String,
}

#[derive(Clone)]
struct AuthKeys {
    user: String,
    secret: String,
}

impl AuthKeys {
    fn issue(&self, user: &str, kind: &str, ttl_secs: i64) -> Result<String> {
        let claims = Claims {
            sub: user.to_string(),
            exp: (Utc::now().timestamp() + ttl_secs) as usize,
            kind: kind.to_string(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|err| HttpError::Internal(format!("token encoding failed: {err}")))
    }

    fn verify(&self, token: &str, kind: &str) -> Result<Claims> {
        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|err| HttpError::Unauthorized(format!("invalid token: {err}")))?;
        if claims.kind != kind {
            return Err(HttpError::Unauthorized(format!(
                "expected a {kind} token"
            )));
        }
        Ok(claims)
    }
}

/// Start the provider and register it as `yamf-auth`. Fails fast when the
/// admin credentials are not configured.
pub async fn start(config: &Config) -> anyhow::Result<ServiceHandle> {
    let keys = AuthKeys {
        user: config
            .admin_user
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ADMIN_USER is required for the auth provider"))?,
        secret: config
            .admin_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ADMIN_SECRET is required for the auth provider"))?,
    };

    let login_keys = keys.clone();
    let refresh_keys = keys.clone();
    let verify_keys = keys.clone();
    let root_keys = keys;

    Service::new(SERVICE_NAME)
        .with_metadata(ServiceMetadata {
            service_type: Some("auth".to_string()),
            ..ServiceMetadata::default()
        })
        .handle("/login", move |payload, parts, _ctx| {
            let keys = login_keys.clone();
            async move { login(&keys, &payload, &parts) }
        })
        .handle("/refresh", move |payload, _parts, _ctx| {
            let keys = refresh_keys.clone();
            async move { refresh(&keys, &payload) }
        })
        .handle("/verify", move |payload, _parts, _ctx| {
            let keys = verify_keys.clone();
            async move { Ok(verify(&keys, &payload)) }
        })
        .handle("*", move |payload, parts, _ctx| {
            let keys = root_keys.clone();
            async move { dispatch_by_payload(&keys, payload, parts) }
        })
        .start(config)
        .await
}

/// The verification contract used by the registry's auth gate: a
/// `verifyAccess` payload against the instance root.
fn dispatch_by_payload(keys: &AuthKeys, payload: Payload, parts: Parts) -> Result<Reply> {
    let Some(body) = payload.as_json() else {
        return Err(HttpError::BadRequest("expected a JSON body".into()));
    };
    if body.get("verifyAccess").is_some() {
        return Ok(verify(keys, &payload));
    }
    if body.get("refreshToken").is_some() {
        return refresh(keys, &payload);
    }
    login(keys, &payload, &parts)
}

fn login(keys: &AuthKeys, payload: &Payload, parts: &Parts) -> Result<Reply> {
    let (user, secret) = credentials_from(payload, parts)?;
    if user != keys.user || secret != keys.secret {
        return Err(HttpError::Unauthorized("invalid credentials".into()));
    }
    Ok(Reply::Value(json!({
        "accessToken": keys.issue(&user, "access", ACCESS_TTL_SECS)?,
        "refreshToken": keys.issue(&user, "refresh", REFRESH_TTL_SECS)?,
    })))
}

fn refresh(keys: &AuthKeys, payload: &Payload) -> Result<Reply> {
    let token = payload
        .as_json()
        .and_then(|body| body.get("refreshToken"))
        .and_then(|token| token.as_str())
        .ok_or_else(|| HttpError::BadRequest("refreshToken is required".into()))?;
    let claims = keys.verify(token, "refresh")?;
    Ok(Reply::Value(json!({
        "accessToken": keys.issue(&claims.sub, "access", ACCESS_TTL_SECS)?,
    })))
}

/// Verification never errors at the HTTP level; a bad token is reported as
/// an error flag the registry's auth gate checks for.
fn verify(keys: &AuthKeys, payload: &Payload) -> Reply {
    let token = payload
        .as_json()
        .and_then(|body| body.get("verifyAccess"))
        .and_then(|token| token.as_str());
    let Some(token) = token else {
        return Reply::Value(json!({ "error": "verifyAccess is required" }));
    };
    match keys.verify(token, "access") {
        Ok(claims) => Reply::Value(json!({ "ok": true, "user": claims.sub })),
        Err(_) => Reply::Value(json!({ "error": "invalid token" })),
    }
}

/// Credentials come as a JSON `{user, secret}` body or an
/// `Authorization: Basic` header.
fn credentials_from(payload: &Payload, parts: &Parts) -> Result<(String, String)> {
    if let Some(body) = payload.as_json() {
        if let (Some(user), Some(secret)) = (
            body.get("user").and_then(|v| v.as_str()),
            body.get("secret").and_then(|v| v.as_str()),
        ) {
            return Ok((user.to_string(), secret.to_string()));
        }
    }

    let basic = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or_else(|| HttpError::BadRequest("credentials are required".into()))?;
    let decoded = BASE64
        .decode(basic)
        .map_err(|_| HttpError::BadRequest("malformed Basic credentials".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| HttpError::BadRequest("malformed Basic credentials".into()))?;
    let (user, secret) = decoded
        .split_once(':')
        .ok_or_else(|| HttpError::BadRequest("malformed Basic credentials".into()))?;
    Ok((user.to_string(), secret.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> AuthKeys {
        AuthKeys {
            user: "admin".into(),
            secret: "hunter2".into(),
        }
    }

    fn parts_with(headers: &[(&str, &str)]) -> Parts {
        let mut builder = axum::http::Request::builder().uri("/login");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn json_payload(value: serde_json::Value) -> Payload {
        Payload::Json(value)
    }

    #[test]
    fn test_login_with_json_credentials() {
        let reply = login(
            &keys(),
            &json_payload(json!({ "user": "admin", "secret": "hunter2" })),
            &parts_with(&[]),
        )
        .unwrap();
        match reply {
            Reply::Value(value) => {
                assert!(value["accessToken"].as_str().unwrap().contains('.'));
                assert!(value["refreshToken"].as_str().unwrap().contains('.'));
            }
            _ => panic!("expected a value reply"),
        }
    }

    #[test]
    fn test_login_with_basic_header() {
        let encoded = BASE64.encode("admin:hunter2");
        let reply = login(
            &keys(),
            &Payload::Empty,
            &parts_with(&[("authorization", &format!("Basic {encoded}"))]),
        );
        assert!(reply.is_ok());
    }

    #[test]
    fn test_login_rejects_wrong_secret() {
        let err = login(
            &keys(),
            &json_payload(json!({ "user": "admin", "secret": "wrong" })),
            &parts_with(&[]),
        )
        .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_verify_round_trip() {
        let keys = keys();
        let token = keys.issue("admin", "access", ACCESS_TTL_SECS).unwrap();
        let reply = verify(&keys, &json_payload(json!({ "verifyAccess": token })));
        match reply {
            Reply::Value(value) => {
                assert_eq!(value["ok"], true);
                assert_eq!(value["user"], "admin");
            }
            _ => panic!("expected a value reply"),
        }
    }

    #[test]
    fn test_verify_flags_bad_token() {
        let reply = verify(&keys(), &json_payload(json!({ "verifyAccess": "garbage" })));
        match reply {
            Reply::Value(value) => assert_eq!(value["error"], "invalid token"),
            _ => panic!("expected a value reply"),
        }
    }

    #[test]
    fn test_refresh_token_kind_enforced() {
        let keys = keys();
        let access = keys.issue("admin", "access", ACCESS_TTL_SECS).unwrap();
        let err = refresh(&keys, &json_payload(json!({ "refreshToken": access }))).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);

        let refresh_token = keys.issue("admin", "refresh", REFRESH_TTL_SECS).unwrap();
        assert!(refresh(&keys, &json_payload(json!({ "refreshToken": refresh_token }))).is_ok());
    }
}
