use crate::admission::Admission;
use crate::error::{Error, Result};
use crate::handlers::{admission_stats, current_config, health_check, index, AppState};
use crate::middleware::{admit_request, track_in_flight};
use crate::shutdown::{shutdown_signal, DrainReport};
use axum::routing::get;
use axum::{middleware, Router};
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Builds the router. `/health` bypasses admission and in-flight tracking so
/// probes keep working under load and while draining.
pub fn create_app(state: AppState) -> Router {
    let admitted = Router::new()
        .route("/", get(index))
        .route("/admin/stats", get(admission_stats))
        .route("/admin/config", get(current_config))
        .route_layer(middleware::from_fn_with_state(state.clone(), admit_request))
        .route_layer(middleware::from_fn_with_state(
            state.coordinator.clone(),
            track_in_flight,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(admitted)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Binds the configured address and serves until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<DrainReport> {
        let addr = self.state.config.bind_address;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;

        self.serve(listener, shutdown_signal()).await
    }

    /// Serves on `listener` until `signal` resolves or draining is requested
    /// through the coordinator, then drains within the configured timeout.
    ///
    /// On a forced stop the accept loop is aborted and handlers still running
    /// are cancelled by `track_in_flight`, which answers them with 503.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<DrainReport>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let config = Arc::clone(&self.state.config);
        let coordinator = self.state.coordinator.clone();

        info!(
            "Turnstile listening on {} (global {}/{}, client {}/{})",
            listener.local_addr()?,
            config.global_burst,
            humantime::format_duration(config.global_refill_interval),
            config.client_burst,
            humantime::format_duration(config.client_refill_interval),
        );

        let sweeper = config.idle_sweep().map(|ttl| {
            spawn_idle_sweeper(
                Arc::clone(&self.state.admission),
                ttl,
                config.sweep_interval,
                coordinator.drain_requested(),
            )
        });

        let app = create_app(self.state);
        let mut server = tokio::spawn(
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(coordinator.drain_requested())
            .into_future(),
        );

        tokio::select! {
            joined = &mut server => {
                warn!("Server stopped without a shutdown request");
                flatten(joined)?;
            }
            _ = signal => {}
            _ = coordinator.drain_requested() => {}
        }

        let report = coordinator.drain(config.drain_timeout).await;
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        if report.is_forced() {
            server.abort();
        } else if !server.is_finished() {
            let remaining = config.drain_timeout.saturating_sub(report.elapsed);
            match tokio::time::timeout(remaining, &mut server).await {
                Ok(joined) => flatten(joined)?,
                Err(_) => {
                    warn!("Idle connections still open at the drain deadline; closing them");
                    server.abort();
                }
            }
        }

        info!(outcome = ?report.outcome, "Server stopped");
        Ok(report)
    }
}

fn flatten(joined: std::result::Result<std::io::Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result.map_err(Error::from),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
    }
}

/// Periodically forgets clients idle for at least `ttl`, until `stop` resolves.
pub fn spawn_idle_sweeper<F>(
    admission: Arc<Admission>,
    ttl: Duration,
    every: Duration,
    stop: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let Some(first_tick) = tokio::time::Instant::now().checked_add(every) else {
            warn!(every = ?every, "Sweep interval out of range; idle clients will not be swept");
            return;
        };
        let mut ticker = tokio::time::interval_at(first_tick, every);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = admission.clients().evict_idle(ttl);
                    if evicted > 0 {
                        debug!(
                            evicted,
                            remaining = admission.clients().len(),
                            "Evicted idle clients"
                        );
                    }
                }
                _ = &mut stop => break,
            }
        }
    })
}
