//! Instance selection for lookups and proxied calls.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;

use crate::error::{HttpError, Result};
use crate::state::RegistryState;

/// Selection strategy. Explicit lookups default to random; the streaming
/// proxy uses round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    Random,
    RoundRobin,
}

impl Strategy {
    pub fn parse(raw: &str) -> Result<Strategy> {
        match raw.to_ascii_lowercase().as_str() {
            "random" => Ok(Strategy::Random),
            "round-robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            // TODO: least-connections and least-response-time need per-call
            // accounting on the proxy before they can be implemented.
            "least-connections" | "least-response-time" => Err(HttpError::BadRequest(format!(
                "load balancing strategy not implemented: {raw}"
            ))),
            _ => Err(HttpError::BadRequest(format!(
                "unknown load balancing strategy: {raw}"
            ))),
        }
    }
}

#[derive(Debug, Default)]
pub struct LoadBalancer {
    /// Per-service round-robin position. The instance count is sampled at
    /// call time, so concurrent membership changes are tolerated.
    counters: Mutex<HashMap<String, usize>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        LoadBalancer::default()
    }

    /// All registered endpoints of a service; 404 when none exist.
    pub async fn get_addresses(&self, state: &RegistryState, service: &str) -> Result<Vec<String>> {
        let services = state.services.read().await;
        match services.get(service) {
            Some(addresses) if !addresses.is_empty() => Ok(addresses.clone()),
            _ => Err(HttpError::NotFound(format!(
                "no service instances registered for \"{service}\""
            ))),
        }
    }

    /// Pick one endpoint of a service using the given strategy.
    pub async fn pick(
        &self,
        state: &RegistryState,
        service: &str,
        strategy: Strategy,
    ) -> Result<String> {
        let addresses = self.get_addresses(state, service).await?;
        let index = match strategy {
            Strategy::Random => rand::thread_rng().gen_range(0..addresses.len()),
            Strategy::RoundRobin => self.next_round_robin(service, addresses.len()),
        };
        Ok(addresses[index].clone())
    }

    fn next_round_robin(&self, service: &str, len: usize) -> usize {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let slot = counters
            .entry(service.to_string())
            .or_insert_with(|| rand::thread_rng().gen_range(0..len));
        let index = *slot % len;
        *slot = (index + 1) % len;
        index
    }

    /// Forget all round-robin positions.
    pub fn reset(&self) {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn state_with(service: &str, addresses: &[&str]) -> RegistryState {
        let state = RegistryState::new();
        state.services.write().await.insert(
            service.to_string(),
            addresses.iter().map(|a| a.to_string()).collect(),
        );
        state
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(Strategy::parse("random").unwrap(), Strategy::Random);
        assert_eq!(Strategy::parse("Round-Robin").unwrap(), Strategy::RoundRobin);
        assert!(Strategy::parse("least-connections").is_err());
        assert!(Strategy::parse("fastest").is_err());
    }

    #[tokio::test]
    async fn test_get_addresses_unknown_service_is_404() {
        let state = RegistryState::new();
        let balancer = LoadBalancer::new();
        let err = balancer.get_addresses(&state, "ghost").await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_random_pick_returns_member() {
        let state = state_with("echo", &["http://localhost:10001", "http://localhost:10002"]).await;
        let balancer = LoadBalancer::new();
        for _ in 0..20 {
            let picked = balancer.pick(&state, "echo", Strategy::Random).await.unwrap();
            assert!(picked.starts_with("http://localhost:1000"));
        }
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_instance_once_per_cycle() {
        let addresses = [
            "http://localhost:10001",
            "http://localhost:10002",
            "http://localhost:10003",
        ];
        let state = state_with("echo", &addresses).await;
        let balancer = LoadBalancer::new();

        let mut seen = Vec::new();
        for _ in 0..addresses.len() {
            seen.push(
                balancer
                    .pick(&state, "echo", Strategy::RoundRobin)
                    .await
                    .unwrap(),
            );
        }
        seen.sort();
        let mut expected: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_round_robin_tolerates_membership_change() {
        let state = state_with("echo", &["http://localhost:10001", "http://localhost:10002"]).await;
        let balancer = LoadBalancer::new();
        let _ = balancer.pick(&state, "echo", Strategy::RoundRobin).await.unwrap();

        state
            .services
            .write()
            .await
            .insert("echo".into(), vec!["http://localhost:10001".into()]);

        // Shrunk to one instance: every subsequent pick must be that one.
        for _ in 0..3 {
            let picked = balancer.pick(&state, "echo", Strategy::RoundRobin).await.unwrap();
            assert_eq!(picked, "http://localhost:10001");
        }
    }

    #[tokio::test]
    async fn test_reset_clears_positions() {
        let state = state_with("echo", &["http://localhost:10001"]).await;
        let balancer = LoadBalancer::new();
        let _ = balancer.pick(&state, "echo", Strategy::RoundRobin).await.unwrap();
        balancer.reset();
        assert!(balancer.counters.lock().unwrap().is_empty());
    }
}
