use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::admission::DenyReason;

/// Point-in-time copy of the admission counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_global: u64,
    pub denied_client: u64,
    pub since: u64,
}

impl AdmissionSnapshot {
    pub fn denied_requests(&self) -> u64 {
        self.denied_global + self.denied_client
    }
}

/// Lock-free counters updated on every admission decision.
#[derive(Debug)]
pub struct AdmissionMetrics {
    allowed: AtomicU64,
    denied_global: AtomicU64,
    denied_client: AtomicU64,
    since: u64,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self {
            allowed: AtomicU64::new(0),
            denied_global: AtomicU64::new(0),
            denied_client: AtomicU64::new(0),
            since: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self, reason: DenyReason) {
        let counter = match reason {
            DenyReason::GlobalLimit => &self.denied_global,
            DenyReason::ClientLimit => &self.denied_client,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let allowed_requests = self.allowed.load(Ordering::Relaxed);
        let denied_global = self.denied_global.load(Ordering::Relaxed);
        let denied_client = self.denied_client.load(Ordering::Relaxed);

        AdmissionSnapshot {
            total_requests: allowed_requests + denied_global + denied_client,
            allowed_requests,
            denied_global,
            denied_client,
            since: self.since,
        }
    }
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_split_by_reason() {
        let metrics = AdmissionMetrics::new();
        metrics.record_allowed();
        metrics.record_allowed();
        metrics.record_denied(DenyReason::GlobalLimit);
        metrics.record_denied(DenyReason::ClientLimit);
        metrics.record_denied(DenyReason::ClientLimit);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 5);
        assert_eq!(snapshot.allowed_requests, 2);
        assert_eq!(snapshot.denied_global, 1);
        assert_eq!(snapshot.denied_client, 2);
        assert_eq!(snapshot.denied_requests(), 3);
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = AdmissionMetrics::new().snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["total_requests"], 0);
        assert!(json["since"].as_u64().unwrap() > 0);
    }
}
