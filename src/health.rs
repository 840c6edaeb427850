use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime};

use crate::shutdown::{ShutdownCoordinator, ShutdownState};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub shutdown_state: String,
    pub in_flight: usize,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Reports whether the service is accepting work.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    coordinator: ShutdownCoordinator,
    started: Instant,
}

impl HealthChecker {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self {
            coordinator,
            started: Instant::now(),
        }
    }

    pub fn check_health(&self) -> HealthStatus {
        let state = self.coordinator.state();
        let (status, shutdown_state) = match state {
            ShutdownState::Running => ("healthy", "running"),
            ShutdownState::Draining => ("draining", "draining"),
            ShutdownState::Stopped => ("stopped", "stopped"),
        };

        HealthStatus {
            status: status.to_string(),
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            shutdown_state: shutdown_state.to_string(),
            in_flight: self.coordinator.in_flight(),
        }
    }
}
