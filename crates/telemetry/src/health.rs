//! Component health aggregation for the liveness and readiness endpoints.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Aggregate health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health state for one pipeline component.
#[derive(Debug)]
pub struct ComponentHealth {
    name: &'static str,
    healthy: AtomicBool,
    message: parking_lot::RwLock<Option<String>>,
}

impl ComponentHealth {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            healthy: AtomicBool::new(false),
            message: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_healthy(&self) {
        self.healthy.store(true, Ordering::Relaxed);
        *self.message.write() = None;
    }

    pub fn set_unhealthy(&self, msg: impl Into<String>) {
        self.healthy.store(false, Ordering::Relaxed);
        *self.message.write() = Some(msg.into());
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn message(&self) -> Option<String> {
        self.message.read().clone()
    }
}

/// Aggregated health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentReport {
    pub name: String,
    pub healthy: bool,
    pub message: Option<String>,
}

/// Global health registry for the pipeline's external collaborators.
pub struct HealthRegistry {
    pub broker: ComponentHealth,
    pub database: ComponentHealth,
    pub cdc: ComponentHealth,
    pub canary: ComponentHealth,
}

impl HealthRegistry {
    pub const fn new() -> Self {
        Self {
            broker: ComponentHealth::new("broker"),
            database: ComponentHealth::new("database"),
            cdc: ComponentHealth::new("cdc"),
            canary: ComponentHealth::new("canary"),
        }
    }

    fn components(&self) -> [&ComponentHealth; 4] {
        [&self.broker, &self.database, &self.cdc, &self.canary]
    }

    /// Generate a health report across all components.
    pub fn report(&self) -> HealthReport {
        let components: Vec<ComponentReport> = self
            .components()
            .iter()
            .map(|component| ComponentReport {
                name: component.name().to_string(),
                healthy: component.is_healthy(),
                message: component.message(),
            })
            .collect();

        let all = components.iter().all(|c| c.healthy);
        let any = components.iter().any(|c| c.healthy);
        let status = if all {
            HealthStatus::Healthy
        } else if any {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport { status, components }
    }

    /// Readiness: degraded when egress is circuit-open, the CDC stream is
    /// reconnecting, or the store is unreachable.
    pub fn is_ready(&self) -> bool {
        self.database.is_healthy() && self.cdc.is_healthy() && self.canary.is_healthy()
    }

    /// Liveness: the process is up and serving.
    pub fn is_alive(&self) -> bool {
        true
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global health registry.
pub static HEALTH: std::sync::LazyLock<HealthRegistry> =
    std::sync::LazyLock::new(HealthRegistry::new);

/// Get the global health registry.
pub fn health() -> &'static HealthRegistry {
    &HEALTH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_degrades_when_one_component_fails() {
        let registry = HealthRegistry::new();
        registry.broker.set_healthy();
        registry.database.set_healthy();
        registry.cdc.set_healthy();
        registry.canary.set_unhealthy("circuit open");

        let report = registry.report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!registry.is_ready());

        registry.canary.set_healthy();
        assert_eq!(registry.report().status, HealthStatus::Healthy);
        assert!(registry.is_ready());
    }
}
