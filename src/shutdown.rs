//! Graceful shutdown.
//!
//! [`ShutdownCoordinator`] is a one-way state machine
//! `Running -> Draining -> Stopped`. It is driven by two events: a termination
//! request ([`ShutdownCoordinator::begin_drain`]) and the in-flight request
//! count reaching zero. Neither depends on how OS signals arrive, so the
//! coordinator runs the same with or without real signals.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// A request that was still running when the drain deadline passed.
#[derive(Debug, Clone, Serialize)]
pub struct InterruptedRequest {
    pub id: Uuid,
    pub method: String,
    pub path: String,
    #[serde(with = "humantime_serde")]
    pub running_for: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Every in-flight request finished before the deadline.
    Completed,
    /// The deadline passed with requests still running.
    Forced,
}

/// Result of a drain.
///
/// Handlers wrapped by `track_in_flight` are cancelled when the coordinator
/// stops, so the requests listed in `interrupted` do not keep running.
#[derive(Debug, Clone, Serialize)]
pub struct DrainReport {
    pub outcome: DrainOutcome,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub interrupted: Vec<InterruptedRequest>,
}

impl DrainReport {
    pub fn is_forced(&self) -> bool {
        self.outcome == DrainOutcome::Forced
    }
}

#[derive(Debug)]
struct InFlight {
    method: String,
    path: String,
    started: Instant,
}

#[derive(Debug)]
struct Inner {
    state: watch::Sender<ShutdownState>,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    idle: Notify,
}

impl Inner {
    fn requests(&self) -> MutexGuard<'_, HashMap<Uuid, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracks in-flight requests and coordinates a bounded drain.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            inner: Arc::new(Inner {
                state,
                in_flight: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.inner.state.borrow()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.requests().len()
    }

    /// Registers a request for the duration of the returned guard.
    ///
    /// Returns `None` once draining has begun; the request must be refused.
    pub fn track(&self, method: &str, path: &str) -> Option<InFlightGuard> {
        let mut requests = self.inner.requests();
        if self.state() != ShutdownState::Running {
            return None;
        }

        let id = Uuid::new_v4();
        requests.insert(
            id,
            InFlight {
                method: method.to_string(),
                path: path.to_string(),
                started: Instant::now(),
            },
        );

        Some(InFlightGuard {
            inner: Arc::clone(&self.inner),
            id,
        })
    }

    /// Stops admitting new work. Returns `false` if draining had already begun.
    pub fn begin_drain(&self) -> bool {
        // Hold the request map so no `track` call can slip in after the switch.
        let requests = self.inner.requests();
        let started = self.inner.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        });

        if started {
            info!(in_flight = requests.len(), "Draining: no longer accepting new requests");
        }
        started
    }

    /// Resolves once draining has begun. Suitable for `with_graceful_shutdown`.
    pub fn drain_requested(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.inner.state.subscribe();
        async move {
            // Err means every coordinator handle is gone; stop as well.
            let _ = state
                .wait_for(|state| *state != ShutdownState::Running)
                .await;
        }
    }

    /// Resolves once the coordinator has stopped.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.inner.state.subscribe();
        async move {
            let _ = state
                .wait_for(|state| *state == ShutdownState::Stopped)
                .await;
        }
    }

    /// Waits up to `timeout` for in-flight requests, then moves to `Stopped`.
    ///
    /// Begins draining if that has not happened yet. Calling this on a stopped
    /// coordinator returns immediately.
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        let started = Instant::now();

        if self.state() == ShutdownState::Stopped {
            return DrainReport {
                outcome: DrainOutcome::Completed,
                elapsed: Duration::ZERO,
                interrupted: Vec::new(),
            };
        }
        self.begin_drain();

        // Beyond the range of `Instant` the deadline never arrives.
        let deadline = started.checked_add(timeout).map(tokio::time::Instant::from_std);
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.inner.requests().is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut idle => {}
                _ = deadline_passed(deadline) => break,
            }
        }

        let interrupted = {
            let requests = self.inner.requests();
            self.inner.state.send_replace(ShutdownState::Stopped);

            let now = Instant::now();
            requests
                .iter()
                .map(|(id, request)| InterruptedRequest {
                    id: *id,
                    method: request.method.clone(),
                    path: request.path.clone(),
                    running_for: now.saturating_duration_since(request.started),
                })
                .collect::<Vec<_>>()
        };

        let report = DrainReport {
            outcome: if interrupted.is_empty() {
                DrainOutcome::Completed
            } else {
                DrainOutcome::Forced
            },
            elapsed: started.elapsed(),
            interrupted,
        };

        if report.is_forced() {
            for request in &report.interrupted {
                warn!(
                    request_id = %request.id,
                    method = %request.method,
                    path = %request.path,
                    running_for_ms = request.running_for.as_millis() as u64,
                    "Request interrupted by shutdown"
                );
            }
            error!(
                interrupted = report.interrupted.len(),
                timeout_ms = timeout.as_millis() as u64,
                "Drain timed out; forcing stop"
            );
        } else {
            info!(elapsed_ms = report.elapsed.as_millis() as u64, "Drain complete");
        }

        report
    }
}

async fn deadline_passed(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks a request as in flight until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Inner>,
    id: Uuid,
}

impl InFlightGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut requests = self.inner.requests();
        requests.remove(&self.id);
        if requests.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
