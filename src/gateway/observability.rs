use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub auth_failures: u64,
    pub rate_limited: u64,
    pub over_capacity: u64,
    pub backend_calls: u64,
    pub backend_errors: u64,
    pub timeouts: u64,
    pub evictions: u64,
}

/// Process-wide counters, updated lock-free from request handlers and the memory guardian.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    auth_failures: AtomicU64,
    rate_limited: AtomicU64,
    over_capacity: AtomicU64,
    backend_calls: AtomicU64,
    backend_errors: AtomicU64,
    timeouts: AtomicU64,
    evictions: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
        Some(n.saturating_add(by))
    });
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests, 1);
    }

    pub fn record_auth_failure(&self) {
        bump(&self.auth_failures, 1);
    }

    pub fn record_rate_limited(&self) {
        bump(&self.rate_limited, 1);
    }

    pub fn record_over_capacity(&self) {
        bump(&self.over_capacity, 1);
    }

    pub fn record_backend_call(&self) {
        bump(&self.backend_calls, 1);
    }

    pub fn record_backend_error(&self) {
        bump(&self.backend_errors, 1);
    }

    pub fn record_timeout(&self) {
        bump(&self.timeouts, 1);
    }

    pub fn record_evictions(&self, count: usize) {
        bump(&self.evictions, count as u64);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            over_capacity: self.over_capacity.load(Ordering::Relaxed),
            backend_calls: self.backend_calls.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
