//! Gateway end-to-end tests: the pull mirror, the notify-then-pull refresh,
//! and the command surface the gateway refuses.

use std::time::Duration;

use serde_json::json;
use yamf::gateway::start_gateway;
use yamf::server::start_registry;
use yamf::service_host::{Reply, Service};
use yamf::{Config, RegistryClient};

fn test_config() -> Config {
    Config {
        environment: "test".into(),
        ..Config::default()
    }
}

/// Reserve a port for the gateway so the registry can know the gateway URL
/// before either process starts, the way fixed deployment URLs would.
async fn reserve_port() -> u16 {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn eventually<F, Fut>(mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..60 {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn notify_then_pull_keeps_the_mirror_fresh() {
    let gateway_port = reserve_port().await;
    let gateway_url = format!("http://127.0.0.1:{gateway_port}");

    let registry = start_registry(
        Config {
            gateway_url: Some(gateway_url.clone()),
            ..test_config()
        },
        Some(0),
    )
    .await
    .unwrap();

    let gateway = start_gateway(
        Config {
            registry_url: Some(registry.url()),
            gateway_url: Some(gateway_url),
            ..test_config()
        },
        Some(gateway_port),
    )
    .await
    .unwrap();

    // The registry pre-registered the gateway; the initial pull mirrors it.
    let gateway_client = RegistryClient::new(gateway.url(), None);
    let gc = &gateway_client;
    assert!(
        eventually(|| async move { gc.lookup("yamf-gateway").await.is_ok() }).await,
        "initial pull must mirror the pre-registered gateway"
    );

    // Registering a service at the registry notifies the gateway, which
    // pulls and can then resolve the service itself.
    let config = Config {
        registry_url: Some(registry.url()),
        ..test_config()
    };
    let echo = Service::new("echo")
        .handle("*", |payload, _parts, _ctx| async move {
            Ok(Reply::Value(payload.as_json().cloned().unwrap_or(json!(null))))
        })
        .start(&config)
        .await
        .unwrap();

    assert!(
        eventually(|| async move { gc.lookup("echo").await.is_ok() }).await,
        "registration must propagate to the gateway mirror"
    );

    // Dispatch through the gateway works exactly like the registry.
    let http = reqwest::Client::new();
    let response = http
        .post(gateway.url())
        .header("yamf-command", "service-call")
        .header("yamf-service-name", "echo")
        .json(&json!({ "via": "gateway" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["via"], "gateway");

    // The health report carries the last pull time.
    let health = gateway_client.health().await.unwrap();
    assert!(health["lastPull"].is_i64());

    echo.terminate().await.unwrap();
    gateway.terminate().await;
    registry.terminate().await;
}

#[tokio::test]
async fn explicit_update_notification_triggers_a_pull() {
    let registry = start_registry(test_config(), Some(0)).await.unwrap();
    let gateway = start_gateway(
        Config {
            registry_url: Some(registry.url()),
            ..test_config()
        },
        Some(0),
    )
    .await
    .unwrap();

    // Mutate the registry after the gateway's initial pull.
    let registry_client = RegistryClient::new(registry.url(), None);
    let location = registry_client
        .setup_service("late", "http://localhost")
        .await
        .unwrap();
    registry_client
        .register_service("late", &location, None, None)
        .await
        .unwrap();

    let gateway_client = RegistryClient::new(gateway.url(), None);
    assert!(gateway_client.lookup("late").await.is_err(), "mirror is stale");

    // The notification body is advisory; the gateway pulls the real state.
    let http = reqwest::Client::new();
    let response = http
        .post(gateway.url())
        .header("yamf-registry-updated", 1i64)
        .json(&json!({ "service": "late", "location": location }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let gc = &gateway_client;
    assert!(
        eventually(|| async move { gc.lookup("late").await.is_ok() }).await,
        "notification must trigger a pull"
    );

    gateway.terminate().await;
    registry.terminate().await;
}

#[tokio::test]
async fn gateway_refuses_registration_commands() {
    let registry = start_registry(test_config(), Some(0)).await.unwrap();
    let gateway = start_gateway(
        Config {
            registry_url: Some(registry.url()),
            ..test_config()
        },
        Some(0),
    )
    .await
    .unwrap();

    let http = reqwest::Client::new();
    for command in [
        "service-setup",
        "service-register",
        "service-unregister",
        "route-register",
        "pubsub-subscribe",
        "pubsub-unsubscribe",
        "pubsub-publish",
    ] {
        let response = http
            .post(gateway.url())
            .header("yamf-command", command)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 403, "gateway must refuse {command}");
    }

    gateway.terminate().await;
    registry.terminate().await;
}

#[tokio::test]
async fn pull_payload_lists_every_table() {
    let registry = start_registry(test_config(), Some(0)).await.unwrap();
    let client = RegistryClient::new(registry.url(), None);

    let location = client.setup_service("echo", "http://localhost").await.unwrap();
    client
        .register_service("echo", &location, Some("yamf-auth"), None)
        .await
        .unwrap();
    client.register_route("/echo", "echo", None).await.unwrap();
    client.register_route("/static/*", "echo", None).await.unwrap();

    let snapshot = client.pull().await.unwrap();
    assert_eq!(snapshot.services["echo"], vec![location]);
    assert_eq!(snapshot.routes["/echo"].service, "echo");
    assert_eq!(snapshot.controller_routes["/static/"].service, "echo");
    assert_eq!(snapshot.service_auth["echo"], "yamf-auth");
    assert!(snapshot.timestamp > 0);

    registry.terminate().await;
}
