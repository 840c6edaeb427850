use serde::Serialize;

use crate::metrics::AdmissionSnapshot;
use crate::shutdown::ShutdownState;

#[derive(Debug, Serialize)]
pub struct WelcomeResponse {
    pub status: String,
    pub message: String,
}

impl WelcomeResponse {
    pub fn admitted() -> Self {
        Self {
            status: "ok".to_string(),
            message: "Request admitted".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub admission: AdmissionSnapshot,
    pub tracked_clients: usize,
    pub clients_created: u64,
    pub max_clients: Option<usize>,
    pub global_tokens: f64,
    pub in_flight: usize,
    pub shutdown_state: ShutdownState,
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub message: String,
    pub config: serde_json::Value,
}

impl ConfigResponse {
    pub fn current(config: serde_json::Value) -> Self {
        Self {
            message: "Current configuration".to_string(),
            config,
        }
    }
}
