//! Rolling execution statistics
//!
//! Per-endpoint counters and a bounded ring of recent execution records,
//! assembled into the status report alongside cache and breaker state.
//! Everything here is observational; nothing on the request path blocks on
//! it beyond short lock holds.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::domain_types::EndpointName;
use crate::error::AttemptOutcome;

/// Capacity of the recent-record ring
const RECENT_RECORDS: usize = 256;

/// One appended execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Fingerprint of the request
    pub fingerprint_hash: String,
    /// Endpoint attempted
    pub endpoint: String,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// Attempt duration
    pub duration_ms: u64,
    /// Outcome
    pub outcome: AttemptOutcome,
    /// Bytes sent
    pub bytes_out: u64,
    /// Bytes received
    pub bytes_in: u64,
}

/// Running counters for one endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointCounters {
    /// Attempts issued
    pub attempts: u64,
    /// Successful attempts
    pub successes: u64,
    /// Timeout failures
    pub timeouts: u64,
    /// Capacity refusals
    pub capacity: u64,
    /// Network failures
    pub network: u64,
    /// Policy rejections
    pub policy: u64,
    /// Cancelled attempts
    pub cancelled: u64,
    /// Anything else
    pub other: u64,
}

impl EndpointCounters {
    fn observe(&mut self, outcome: AttemptOutcome) {
        self.attempts += 1;
        match outcome {
            AttemptOutcome::Success => self.successes += 1,
            AttemptOutcome::Timeout => self.timeouts += 1,
            AttemptOutcome::Capacity => self.capacity += 1,
            AttemptOutcome::Network => self.network += 1,
            AttemptOutcome::Policy => self.policy += 1,
            AttemptOutcome::Cancelled => self.cancelled += 1,
            AttemptOutcome::Other => self.other += 1,
        }
    }
}

/// Shared execution log and counters
#[derive(Debug)]
pub struct ExecutionLog {
    started: Instant,
    requests: AtomicU64,
    per_endpoint: DashMap<String, EndpointCounters>,
    recent: Mutex<VecDeque<ExecutionRecord>>,
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionLog {
    /// Creates an empty log
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            per_endpoint: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_RECORDS)),
        }
    }

    /// Counts one inbound request
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Appends one attempt record
    pub fn record_attempt(
        &self,
        fingerprint_hash: &str,
        endpoint: &EndpointName,
        outcome: AttemptOutcome,
        duration_ms: u64,
        bytes_out: u64,
        bytes_in: u64,
    ) {
        self.per_endpoint
            .entry(endpoint.as_str().to_string())
            .or_default()
            .observe(outcome);

        let record = ExecutionRecord {
            fingerprint_hash: fingerprint_hash.to_string(),
            endpoint: endpoint.as_str().to_string(),
            started_at: Utc::now(),
            duration_ms,
            outcome,
            bytes_out,
            bytes_in,
        };
        let mut recent = self.recent.lock().expect("record ring poisoned");
        if recent.len() == RECENT_RECORDS {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    /// Total inbound requests observed
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Seconds since the log was created
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Snapshot of one endpoint's counters
    #[must_use]
    pub fn endpoint_counters(&self, endpoint: &EndpointName) -> EndpointCounters {
        self.per_endpoint
            .get(endpoint.as_str())
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Snapshot of every endpoint's counters
    #[must_use]
    pub fn all_counters(&self) -> Vec<(String, EndpointCounters)> {
        let mut out: Vec<(String, EndpointCounters)> = self
            .per_endpoint
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Most recent records, newest last
    #[must_use]
    pub fn recent_records(&self, limit: usize) -> Vec<ExecutionRecord> {
        let recent = self.recent.lock().expect("record ring poisoned");
        recent
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> EndpointName {
        EndpointName::try_new(s.to_string()).unwrap()
    }

    #[test]
    fn test_counters_accumulate_by_outcome() {
        let log = ExecutionLog::new();
        let local = name("local");
        log.record_attempt("fp", &local, AttemptOutcome::Success, 10, 100, 200);
        log.record_attempt("fp", &local, AttemptOutcome::Timeout, 25_000, 100, 0);
        log.record_attempt("fp", &local, AttemptOutcome::Success, 12, 100, 180);

        let counters = log.endpoint_counters(&local);
        assert_eq!(counters.attempts, 3);
        assert_eq!(counters.successes, 2);
        assert_eq!(counters.timeouts, 1);
    }

    #[test]
    fn test_record_ring_is_bounded() {
        let log = ExecutionLog::new();
        let local = name("local");
        for _ in 0..(RECENT_RECORDS + 50) {
            log.record_attempt("fp", &local, AttemptOutcome::Success, 1, 1, 1);
        }
        assert_eq!(log.recent_records(usize::MAX).len(), RECENT_RECORDS);
    }

    #[test]
    fn test_started_at_is_monotonic_enough() {
        let log = ExecutionLog::new();
        let local = name("local");
        log.record_attempt("a", &local, AttemptOutcome::Success, 1, 1, 1);
        log.record_attempt("b", &local, AttemptOutcome::Success, 1, 1, 1);
        let records = log.recent_records(2);
        assert!(records[0].started_at <= records[1].started_at);
    }
}
