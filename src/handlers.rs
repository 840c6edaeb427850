use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

use crate::admission::Admission;
use crate::config::Config;
use crate::health::HealthChecker;
use crate::response::{ConfigResponse, StatsResponse, WelcomeResponse};
use crate::shutdown::ShutdownCoordinator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<Admission>,
    pub coordinator: ShutdownCoordinator,
    pub config: Arc<Config>,
    pub health: HealthChecker,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let coordinator = ShutdownCoordinator::new();
        Self {
            admission: Arc::new(Admission::from_config(&config)),
            health: HealthChecker::new(coordinator.clone()),
            coordinator,
            config: Arc::new(config),
        }
    }
}

/// Placeholder business handler; only reached once admission allows the request.
pub async fn index() -> impl IntoResponse {
    Json(WelcomeResponse::admitted())
}

/// Admission counters and registry size
pub async fn admission_stats(State(state): State<AppState>) -> impl IntoResponse {
    let clients = state.admission.clients();

    Json(StatsResponse {
        admission: state.admission.metrics().snapshot(),
        tracked_clients: clients.len(),
        clients_created: clients.created(),
        max_clients: clients.max_entries(),
        global_tokens: state.admission.global().tokens(),
        in_flight: state.coordinator.in_flight(),
        shutdown_state: state.coordinator.state(),
    })
}

/// Effective configuration
pub async fn current_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = serde_json::to_value(state.config.as_ref()).unwrap_or_default();
    Json(ConfigResponse::current(config))
}

/// Health check endpoint; 503 once draining has begun
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.health.check_health();
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(status))
}
