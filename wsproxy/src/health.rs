//! Liveness reporting for the long-running loops of the proxy.
//!
//! The process can only be trusted with sockets if the Kafka producer, the
//! session log reader and the handler actor are all making progress, so
//! each registers here and must report healthy within its deadline. The
//! combined status backs the `/_liveness` endpoint: one stalled or
//! unhealthy component fails the probe.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Set at registration, before the first report.
    Starting,
    /// Healthy until the deadline; must be refreshed before then.
    HealthyUntil(Instant),
    /// The component reported itself broken.
    Unhealthy,
}

#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Component name to displayable state, for probe debugging.
    pub components: HashMap<String, String>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Must be called more frequently than the registered deadline.
    /// Callable from any thread, including librdkafka callback threads.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            // Poisoned lock: the probe will fail and the process restart.
            Err(_) => warn!("poisoned health registry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component; the returned handle is given to the component
    /// so it can keep reporting.
    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Combined status over all registered components. An empty registry is
    /// unhealthy: something should have registered before the probe runs.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("poisoned health registry lock");
            return HealthStatus::default();
        };

        let now = Instant::now();
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, component) in components.iter() {
            let display = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => "healthy".to_string(),
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    "stalled".to_string()
                }
                ComponentStatus::Starting => {
                    status.healthy = false;
                    "starting".to_string()
                }
                ComponentStatus::Unhealthy => {
                    status.healthy = false;
                    "unhealthy".to_string()
                }
            };
            status.components.insert(name.clone(), display);
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("reader", Duration::from_secs(30));

        // Registered but not yet reporting
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(status.components.get("reader").map(String::as_str), Some("starting"));

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_status(ComponentStatus::Unhealthy);
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("reader").map(String::as_str),
            Some("unhealthy")
        );
    }

    #[test]
    fn stale_reports_fail_the_probe() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("reader", Duration::from_secs(30));
        // A deadline of "now" is already stale by the time the probe reads it.
        handle.report_status(ComponentStatus::HealthyUntil(Instant::now()));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("reader").map(String::as_str),
            Some("stalled")
        );
    }

    #[test]
    fn one_bad_component_fails_the_whole_probe() {
        let registry = HealthRegistry::new("liveness");
        let one = registry.register("one", Duration::from_secs(30));
        let two = registry.register("two", Duration::from_secs(30));

        one.report_healthy();
        two.report_healthy();
        assert!(registry.get_status().healthy);

        two.report_status(ComponentStatus::Unhealthy);
        assert!(!registry.get_status().healthy);
    }
}
