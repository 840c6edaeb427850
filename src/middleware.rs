use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};

use crate::admission::Decision;
use crate::error::Error;
use crate::handlers::AppState;
use crate::shutdown::ShutdownCoordinator;

/// Registers every request with the shutdown coordinator for as long as it runs.
///
/// Once draining has begun, requests arriving on already-open connections are
/// refused with 503. A handler still running when the drain times out is
/// dropped at its next await point and answered with 503.
pub async fn track_in_flight(
    State(coordinator): State<ShutdownCoordinator>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let Some(guard) = coordinator.track(method.as_str(), &path) else {
        debug!(
            target: "turnstile::middleware",
            method = %method,
            path = %path,
            "Refusing request while shutting down"
        );
        return Err(Error::ShuttingDown);
    };

    debug!(
        target: "turnstile::middleware",
        request_id = %guard.id(),
        method = %method,
        path = %path,
        "Incoming request"
    );

    let response = tokio::select! {
        response = next.run(request) => response,
        _ = coordinator.stopped() => {
            warn!(
                target: "turnstile::middleware",
                request_id = %guard.id(),
                method = %method,
                path = %path,
                "Handler cancelled by forced shutdown"
            );
            return Err(Error::ShuttingDown);
        }
    };

    debug!(
        target: "turnstile::middleware",
        request_id = %guard.id(),
        status = %response.status(),
        "Request completed"
    );

    Ok(response)
}

/// Answers allow/deny before the wrapped handler runs.
pub async fn admit_request(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let client_key = state.config.key_strategy.client_key(&request);

    match state.admission.admit(&client_key) {
        Decision::Allow => Ok(next.run(request).await),
        Decision::Deny {
            reason,
            retry_after,
        } => Err(Error::RateLimited {
            reason,
            retry_after,
        }),
    }
}
