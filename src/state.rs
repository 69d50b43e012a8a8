//! Shared mutable registry state. The registry process owns one instance;
//! the gateway owns a mirror copy that only its pull loop writes.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

/// Optional per-service metadata recorded at registration time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceMetadata {
    pub preregistered: bool,
    pub public: bool,
    /// Pull-only services never receive push notifications and are not
    /// auto-subscribed to the register channel.
    pub pull_only: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<i64>,
}

impl ServiceMetadata {
    pub fn gateway() -> Self {
        ServiceMetadata {
            preregistered: true,
            public: true,
            pull_only: true,
            service_type: Some("gateway".to_string()),
            registered_at: None,
        }
    }
}

/// A route table entry: the owning service plus the default content type
/// applied when the downstream response does not name one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteBinding {
    pub service: String,
    pub data_type: String,
}

/// Everything `registry-pull` hands to the gateway, with sets serialized as
/// lists. Also the unit the gateway swaps its mirror with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySnapshot {
    pub services: HashMap<String, Vec<String>>,
    pub routes: HashMap<String, RouteBinding>,
    pub controller_routes: HashMap<String, RouteBinding>,
    pub service_auth: HashMap<String, String>,
    pub service_metadata: HashMap<String, ServiceMetadata>,
    pub timestamp: i64,
}

/// The registry's concurrent maps, one writer lock per top-level map. All
/// mutation happens through the operation modules; this type only holds the
/// containers and whole-state transitions.
#[derive(Debug, Default)]
pub struct RegistryState {
    /// service name → instance endpoints, insertion-ordered.
    pub services: RwLock<HashMap<String, Vec<String>>>,
    /// exact route path → binding.
    pub routes: RwLock<HashMap<String, RouteBinding>>,
    /// wildcard prefix (trailing `*` stripped) → binding.
    pub controller_routes: RwLock<HashMap<String, RouteBinding>>,
    /// channel name → subscriber endpoints, insertion-ordered.
    pub subscriptions: RwLock<HashMap<String, Vec<String>>>,
    /// `scheme://host` → next port to allocate.
    pub domain_ports: RwLock<HashMap<String, u16>>,
    /// endpoint → owning service, for cleanup on unregister.
    pub addresses: RwLock<HashMap<String, String>>,
    /// service name → auth-provider service name.
    pub service_auth: RwLock<HashMap<String, String>>,
    pub service_metadata: RwLock<HashMap<String, ServiceMetadata>>,
}

impl RegistryState {
    pub fn new() -> Self {
        RegistryState::default()
    }

    pub async fn reset(&self) {
        self.services.write().await.clear();
        self.routes.write().await.clear();
        self.controller_routes.write().await.clear();
        self.subscriptions.write().await.clear();
        self.domain_ports.write().await.clear();
        self.addresses.write().await.clear();
        self.service_auth.write().await.clear();
        self.service_metadata.write().await.clear();
    }

    /// The `service → [endpoints]` map as a plain JSON object, the shape
    /// lookup and register responses use.
    pub async fn serialize_services(&self) -> serde_json::Value {
        json!(self.services.read().await.clone())
    }

    pub async fn serialize_addresses(&self) -> serde_json::Value {
        json!(self.addresses.read().await.clone())
    }

    pub async fn service_count(&self) -> usize {
        self.services.read().await.len()
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            services: self.services.read().await.clone(),
            routes: self.routes.read().await.clone(),
            controller_routes: self.controller_routes.read().await.clone(),
            service_auth: self.service_auth.read().await.clone(),
            service_metadata: self.service_metadata.read().await.clone(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Replace the mirrored portion of the state with a pulled snapshot.
    /// Every write lock is held for the duration of the swap so dispatch
    /// never observes a half-applied mirror.
    pub async fn replace_from_snapshot(&self, snapshot: RegistrySnapshot) {
        let mut services = self.services.write().await;
        let mut routes = self.routes.write().await;
        let mut controller_routes = self.controller_routes.write().await;
        let mut addresses = self.addresses.write().await;
        let mut service_auth = self.service_auth.write().await;
        let mut service_metadata = self.service_metadata.write().await;

        *addresses = snapshot
            .services
            .iter()
            .flat_map(|(name, locations)| {
                locations
                    .iter()
                    .map(move |location| (location.clone(), name.clone()))
            })
            .collect();
        *services = snapshot.services;
        *routes = snapshot.routes;
        *controller_routes = snapshot.controller_routes;
        *service_auth = snapshot.service_auth;
        *service_metadata = snapshot.service_metadata;
    }
}
