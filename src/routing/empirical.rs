//! Empirical routing learner
//!
//! Records execution outcomes per request fingerprint and endpoint, and
//! answers advisory ranking questions for the router. Reads take cloned
//! snapshots; writes for one fingerprint are serialized by the map shard
//! lock. The learner reorders candidates, it never vetoes one.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain_types::{
    EmpiricalDemoteThreshold, EmpiricalMaxEntries, EmpiricalMinSamples, EndpointName,
};
use crate::error::AttemptOutcome;

/// Exponential weight applied to new latency observations
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Running outcome record for one endpoint under one fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmpiricalEntry {
    /// Observations recorded
    pub total: u64,
    /// Successful observations
    pub successes: u64,
    /// Exponentially-weighted average latency
    pub avg_latency_ms: f64,
    /// Failure counts by outcome kind
    pub failure_breakdown: HashMap<AttemptOutcome, u64>,
    /// When this entry last changed
    pub last_update: DateTime<Utc>,
}

impl EmpiricalEntry {
    fn new() -> Self {
        Self {
            total: 0,
            successes: 0,
            avg_latency_ms: 0.0,
            failure_breakdown: HashMap::new(),
            last_update: Utc::now(),
        }
    }

    /// Fraction of observations that succeeded
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.successes as f64 / self.total as f64
    }

    fn observe(&mut self, outcome: AttemptOutcome, latency_ms: u64) {
        self.total += 1;
        #[allow(clippy::cast_precision_loss)]
        let latency = latency_ms as f64;
        if self.total == 1 {
            self.avg_latency_ms = latency;
        } else {
            self.avg_latency_ms =
                LATENCY_EWMA_ALPHA * latency + (1.0 - LATENCY_EWMA_ALPHA) * self.avg_latency_ms;
        }
        if outcome == AttemptOutcome::Success {
            self.successes += 1;
        } else {
            *self.failure_breakdown.entry(outcome).or_insert(0) += 1;
        }
        self.last_update = Utc::now();
    }
}

/// All endpoint entries recorded under one fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintRecord {
    /// Per-endpoint running records, keyed by endpoint name
    pub per_endpoint: HashMap<String, EmpiricalEntry>,
    /// When any entry under this fingerprint last changed
    pub last_update: DateTime<Utc>,
}

impl FingerprintRecord {
    fn new() -> Self {
        Self {
            per_endpoint: HashMap::new(),
            last_update: Utc::now(),
        }
    }
}

/// On-disk snapshot shape
#[derive(Debug, Serialize, Deserialize)]
struct EmpiricalSnapshot {
    saved_at: DateTime<Utc>,
    entries: HashMap<String, FingerprintRecord>,
}

/// Concurrent, bounded table of empirical routing evidence
#[derive(Debug)]
pub struct EmpiricalLearner {
    entries: DashMap<String, FingerprintRecord>,
    max_entries: usize,
}

impl EmpiricalLearner {
    /// Creates an empty learner
    #[must_use]
    pub fn new(max_entries: EmpiricalMaxEntries) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.as_usize(),
        }
    }

    /// Records one execution outcome
    pub fn record(
        &self,
        fingerprint_hash: &str,
        endpoint: &EndpointName,
        outcome: AttemptOutcome,
        latency_ms: u64,
    ) {
        {
            let mut record = self
                .entries
                .entry(fingerprint_hash.to_string())
                .or_insert_with(FingerprintRecord::new);
            record
                .per_endpoint
                .entry(endpoint.as_str().to_string())
                .or_insert_with(EmpiricalEntry::new)
                .observe(outcome, latency_ms);
            record.last_update = Utc::now();
        }
        self.evict_if_needed();
    }

    /// Cloned snapshot of the record for one fingerprint
    #[must_use]
    pub fn fingerprint_record(&self, fingerprint_hash: &str) -> Option<FingerprintRecord> {
        self.entries.get(fingerprint_hash).map(|r| r.clone())
    }

    /// Cloned snapshot of one endpoint's entry under one fingerprint
    #[must_use]
    pub fn endpoint_entry(
        &self,
        fingerprint_hash: &str,
        endpoint: &EndpointName,
    ) -> Option<EmpiricalEntry> {
        self.entries
            .get(fingerprint_hash)
            .and_then(|record| record.per_endpoint.get(endpoint.as_str()).cloned())
    }

    /// Whether evidence says this endpoint should be demoted for this key
    ///
    /// True only with at least `min_samples` observations and a success rate
    /// below `threshold`.
    #[must_use]
    pub fn should_demote(
        &self,
        fingerprint_hash: &str,
        endpoint: &EndpointName,
        threshold: EmpiricalDemoteThreshold,
        min_samples: EmpiricalMinSamples,
    ) -> bool {
        self.endpoint_entry(fingerprint_hash, endpoint)
            .is_some_and(|entry| {
                entry.total >= min_samples.as_u64() && entry.success_rate() < threshold.as_f64()
            })
    }

    /// Best-performing endpoint for this fingerprint, for routing hints
    ///
    /// Skips the named endpoints and requires at least `min_samples`
    /// observations.
    #[must_use]
    pub fn best_alternative(
        &self,
        fingerprint_hash: &str,
        exclude: &[&EndpointName],
        min_samples: EmpiricalMinSamples,
    ) -> Option<(String, f64)> {
        let record = self.entries.get(fingerprint_hash)?;
        record
            .per_endpoint
            .iter()
            .filter(|(name, entry)| {
                entry.total >= min_samples.as_u64()
                    && !exclude.iter().any(|excluded| excluded.as_str() == *name)
            })
            .map(|(name, entry)| (name.clone(), entry.success_rate()))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Highest-volume fingerprints with their aggregate success rates
    #[must_use]
    pub fn top_patterns(&self, limit: usize) -> Vec<EmpiricalPattern> {
        let mut patterns: Vec<EmpiricalPattern> = self
            .entries
            .iter()
            .map(|item| {
                let total: u64 = item.value().per_endpoint.values().map(|e| e.total).sum();
                let successes: u64 =
                    item.value().per_endpoint.values().map(|e| e.successes).sum();
                #[allow(clippy::cast_precision_loss)]
                let success_rate = if total == 0 {
                    0.0
                } else {
                    successes as f64 / total as f64
                };
                EmpiricalPattern {
                    fingerprint_hash: item.key().clone(),
                    total,
                    success_rate,
                }
            })
            .collect();
        patterns.sort_by(|a, b| b.total.cmp(&a.total));
        patterns.truncate(limit);
        patterns
    }

    /// Number of tracked fingerprints
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes a best-effort JSON snapshot
    ///
    /// # Errors
    /// Returns the underlying I/O or serialization error; callers treat the
    /// snapshot as optional and only log the failure.
    pub fn save_snapshot(&self, path: &Path) -> Result<(), std::io::Error> {
        let snapshot = EmpiricalSnapshot {
            saved_at: Utc::now(),
            entries: self
                .entries
                .iter()
                .map(|item| (item.key().clone(), item.value().clone()))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&snapshot).map_err(std::io::Error::other)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), entries = snapshot.entries.len(), "empirical snapshot written");
        Ok(())
    }

    /// Loads a snapshot, discarding it entirely on absence or corruption
    pub fn load_snapshot(&self, path: &Path) {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        match serde_json::from_slice::<EmpiricalSnapshot>(&bytes) {
            Ok(snapshot) => {
                for (hash, record) in snapshot.entries {
                    self.entries.insert(hash, record);
                }
                self.evict_if_needed();
                debug!(path = %path.display(), "empirical snapshot loaded");
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "discarding corrupt empirical snapshot");
            }
        }
    }

    fn evict_if_needed(&self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        // Evict the least-recently-updated tenth so eviction stays amortized.
        let mut by_age: Vec<(String, DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().last_update))
            .collect();
        by_age.sort_by_key(|(_, updated)| *updated);
        let excess = by_age.len().saturating_sub(self.max_entries);
        let to_remove = excess + self.max_entries / 10;
        for (key, _) in by_age.into_iter().take(to_remove) {
            self.entries.remove(&key);
        }
    }
}

/// Aggregate view of one fingerprint for status output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmpiricalPattern {
    /// The fingerprint hash
    pub fingerprint_hash: String,
    /// Observations across all endpoints
    pub total: u64,
    /// Aggregate success rate
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn learner() -> EmpiricalLearner {
        EmpiricalLearner::new(EmpiricalMaxEntries::try_new(100).unwrap())
    }

    fn name(s: &str) -> EndpointName {
        EndpointName::try_new(s.to_string()).unwrap()
    }

    #[test]
    fn test_success_rate_accumulates() {
        let learner = learner();
        let local = name("local");
        for _ in 0..8 {
            learner.record("fp1", &local, AttemptOutcome::Success, 50);
        }
        for _ in 0..2 {
            learner.record("fp1", &local, AttemptOutcome::Timeout, 25_000);
        }
        let entry = learner.endpoint_entry("fp1", &local).unwrap();
        assert_eq!(entry.total, 10);
        assert!((entry.success_rate() - 0.8).abs() < f64::EPSILON);
        assert_eq!(entry.failure_breakdown[&AttemptOutcome::Timeout], 2);
    }

    #[test]
    fn test_demotion_requires_min_samples() {
        let learner = learner();
        let local = name("local");
        let threshold = EmpiricalDemoteThreshold::try_new(0.2).unwrap();
        let min = EmpiricalMinSamples::try_new(10).unwrap();

        for _ in 0..9 {
            learner.record("fp1", &local, AttemptOutcome::Network, 10);
        }
        // Nine observations are not yet evidence.
        assert!(!learner.should_demote("fp1", &local, threshold, min));

        learner.record("fp1", &local, AttemptOutcome::Network, 10);
        assert!(learner.should_demote("fp1", &local, threshold, min));
    }

    #[test]
    fn test_healthy_entry_is_not_demoted() {
        let learner = learner();
        let local = name("local");
        let threshold = EmpiricalDemoteThreshold::try_new(0.2).unwrap();
        let min = EmpiricalMinSamples::try_new(10).unwrap();
        for _ in 0..20 {
            learner.record("fp1", &local, AttemptOutcome::Success, 40);
        }
        assert!(!learner.should_demote("fp1", &local, threshold, min));
    }

    #[test]
    fn test_best_alternative_excludes_attempted() {
        let learner = learner();
        let local = name("local");
        let cloud = name("cloud_a");
        let min = EmpiricalMinSamples::try_new(10).unwrap();
        for _ in 0..10 {
            learner.record("fp1", &local, AttemptOutcome::Timeout, 100);
            learner.record("fp1", &cloud, AttemptOutcome::Success, 400);
        }
        let (best, rate) = learner.best_alternative("fp1", &[&local], min).unwrap();
        assert_eq!(best, "cloud_a");
        assert!((rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_table_is_bounded() {
        let learner = EmpiricalLearner::new(EmpiricalMaxEntries::try_new(16).unwrap());
        let local = name("local");
        for i in 0..40 {
            learner.record(&format!("fp{i}"), &local, AttemptOutcome::Success, 10);
        }
        assert!(learner.len() <= 16);
    }

    #[test]
    fn test_snapshot_round_trip_and_corruption_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empirical.json");

        let learner = learner();
        let local = name("local");
        for _ in 0..5 {
            learner.record("fp1", &local, AttemptOutcome::Success, 30);
        }
        learner.save_snapshot(&path).unwrap();

        let restored = EmpiricalLearner::new(EmpiricalMaxEntries::try_new(100).unwrap());
        restored.load_snapshot(&path);
        assert_eq!(restored.endpoint_entry("fp1", &local).unwrap().total, 5);

        // Corruption is tolerated by discarding the snapshot.
        std::fs::write(&path, b"{not json").unwrap();
        let empty = EmpiricalLearner::new(EmpiricalMaxEntries::try_new(100).unwrap());
        empty.load_snapshot(&path);
        assert!(empty.is_empty());
    }
}
