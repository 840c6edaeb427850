//! Admission decisions: one process-wide bucket in front of per-client buckets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::Config;
use crate::metrics::AdmissionMetrics;
use crate::registry::LimiterRegistry;
use crate::token_bucket::{BucketSettings, TokenBucket};

/// Which limit turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The shared bucket for all traffic is empty.
    GlobalLimit,
    /// The caller's own bucket is empty.
    ClientLimit,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::GlobalLimit => "global_limit",
            DenyReason::ClientLimit => "client_limit",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny {
        reason: DenyReason,
        /// Time until the exhausted bucket holds a whole token again.
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn reason(&self) -> Option<DenyReason> {
        match self {
            Decision::Allow => None,
            Decision::Deny { reason, .. } => Some(*reason),
        }
    }
}

/// Global and per-client rate limits applied before a request reaches its handler.
///
/// The global bucket is consulted first. A request it rejects never touches
/// the caller's bucket, so clients are not charged for server-wide overload.
#[derive(Debug)]
pub struct Admission {
    global: TokenBucket,
    clients: LimiterRegistry,
    metrics: AdmissionMetrics,
}

impl Admission {
    pub fn new(global: BucketSettings, clients: LimiterRegistry) -> Self {
        Self {
            global: global.build(),
            clients,
            metrics: AdmissionMetrics::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let clients =
            LimiterRegistry::new(config.client_bucket()).with_max_entries(config.max_clients);
        Self::new(config.global_bucket(), clients)
    }

    pub fn admit(&self, client_key: &str) -> Decision {
        self.admit_at(client_key, Instant::now())
    }

    /// Never blocks waiting for capacity; the answer reflects the buckets at `now`.
    pub fn admit_at(&self, client_key: &str, now: Instant) -> Decision {
        let decision = self.decide(client_key, now);

        match decision {
            Decision::Allow => self.metrics.record_allowed(),
            Decision::Deny {
                reason,
                retry_after,
            } => {
                self.metrics.record_denied(reason);
                warn!(
                    target: "turnstile::admission",
                    client_key = %client_key,
                    reason = %reason,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Request denied"
                );
            }
        }

        decision
    }

    fn decide(&self, client_key: &str, now: Instant) -> Decision {
        if !self.global.allow_at(now) {
            return Decision::Deny {
                reason: DenyReason::GlobalLimit,
                retry_after: self.global.time_until_available_at(now),
            };
        }

        let bucket = self.clients.get_or_create(client_key);
        if !bucket.allow_at(now) {
            return Decision::Deny {
                reason: DenyReason::ClientLimit,
                retry_after: bucket.time_until_available_at(now),
            };
        }

        Decision::Allow
    }

    pub fn global(&self) -> &TokenBucket {
        &self.global
    }

    pub fn clients(&self) -> &LimiterRegistry {
        &self.clients
    }

    pub fn metrics(&self) -> &AdmissionMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admission(global_burst: u32, client_burst: u32) -> Admission {
        let interval = Duration::from_secs(1);
        Admission::new(
            BucketSettings::new(interval, global_burst),
            LimiterRegistry::new(BucketSettings::new(interval, client_burst)),
        )
    }

    #[test]
    fn test_client_limit_after_burst() {
        let admission = admission(6, 5);
        let now = Instant::now();

        for _ in 0..5 {
            assert_eq!(admission.admit_at("10.0.0.1", now), Decision::Allow);
        }

        let denied = admission.admit_at("10.0.0.1", now);
        assert_eq!(denied.reason(), Some(DenyReason::ClientLimit));
    }

    #[test]
    fn test_equal_bursts_drain_global_first() {
        // Every allowed request spends a global token too, so with equal bursts
        // the shared bucket is what turns the sixth request away.
        let admission = admission(5, 5);
        let now = Instant::now();

        for _ in 0..5 {
            assert!(admission.admit_at("10.0.0.1", now).is_allowed());
        }
        assert_eq!(
            admission.admit_at("10.0.0.1", now).reason(),
            Some(DenyReason::GlobalLimit)
        );
        assert_eq!(
            admission.admit_at("10.0.0.2", now).reason(),
            Some(DenyReason::GlobalLimit)
        );
    }

    #[test]
    fn test_other_client_still_allowed() {
        let admission = admission(100, 5);
        let now = Instant::now();

        for _ in 0..5 {
            assert!(admission.admit_at("10.0.0.1", now).is_allowed());
        }
        assert!(!admission.admit_at("10.0.0.1", now).is_allowed());

        for _ in 0..5 {
            assert!(admission.admit_at("10.0.0.2", now).is_allowed());
        }
        assert_eq!(
            admission.admit_at("10.0.0.2", now).reason(),
            Some(DenyReason::ClientLimit)
        );
    }

    #[test]
    fn test_global_limit_wins_over_client_tokens() {
        let admission = admission(1, 5);
        let now = Instant::now();
        assert!(admission.global().allow_at(now));

        let decision = admission.admit_at("fresh-client", now);
        assert_eq!(decision.reason(), Some(DenyReason::GlobalLimit));
    }

    #[test]
    fn test_global_denial_does_not_charge_client() {
        let admission = admission(1, 2);
        let now = Instant::now();
        assert!(admission.global().allow_at(now));

        for _ in 0..10 {
            assert!(!admission.admit_at("patient", now).is_allowed());
        }

        // The per-client bucket was never created, let alone drained.
        assert!(admission.clients().get("patient").is_none());
    }

    #[test]
    fn test_deny_reports_retry_after() {
        let admission = admission(10, 1);
        let now = Instant::now();
        assert!(admission.admit_at("c", now).is_allowed());

        match admission.admit_at("c", now) {
            Decision::Deny {
                reason,
                retry_after,
            } => {
                assert_eq!(reason, DenyReason::ClientLimit);
                assert!(retry_after > Duration::ZERO && retry_after <= Duration::from_secs(1));
            }
            Decision::Allow => panic!("second request should be denied"),
        }
    }

    #[test]
    fn test_metrics_track_decisions() {
        let admission = admission(3, 2);
        let now = Instant::now();

        admission.admit_at("a", now);
        admission.admit_at("a", now);
        admission.admit_at("a", now);
        admission.admit_at("b", now);

        let snapshot = admission.metrics().snapshot();
        assert_eq!(snapshot.allowed_requests, 2);
        assert_eq!(snapshot.denied_client, 1);
        assert_eq!(snapshot.denied_global, 1);
    }

    #[test]
    fn test_deny_reason_serialization() {
        assert_eq!(
            serde_json::to_string(&DenyReason::GlobalLimit).unwrap(),
            "\"global_limit\""
        );
        assert_eq!(DenyReason::ClientLimit.to_string(), "client_limit");
    }
}
