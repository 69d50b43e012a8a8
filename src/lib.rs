//! yamf — a lightweight microservice framework.
//!
//! Two cooperating HTTP processes form the core: the **registry** (the
//! authoritative map of services, routes, and subscriptions, reached with
//! `yamf-*` command headers) and the **gateway** (a public-facing peer that
//! mirrors registry state through a pull protocol and runs the same
//! dispatcher). Services register themselves through the registry and reach
//! each other through the streaming proxy.

pub mod auth_provider;
pub mod balancer;
pub mod client;
pub mod config;
pub mod content_type;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod proxy;
pub mod pubsub;
pub mod routes;
pub mod server;
pub mod service_host;
pub mod services;
pub mod state;

pub use client::{CallOptions, RegistryClient};
pub use config::{Config, Environment};
pub use error::{HttpError, Result};
pub use protocol::{Command, Payload};
pub use server::{init_tracing, start_registry, App, Role, ServerHandle};
pub use service_host::{Reply, Service, ServiceContext, ServiceHandle};
pub use state::{RegistrySnapshot, ServiceMetadata};
