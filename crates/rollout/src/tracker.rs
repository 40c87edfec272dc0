//! Resource tracker - the ledger of everything a run owns
//!
//! Teardown is implemented purely in terms of this ledger: a resource that was
//! never tracked is never deleted, and a resource that was tracked is either
//! deleted or still tracked afterwards.

use crate::context::RemoteState;
use crate::error::{Error, Result};
use crate::plan::Phase;
use crate::resource::{ResourceRecord, ResourceSpec};
use crate::types::{ResourceKey, ResourceStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Result of [`ResourceTracker::untrack_and_delete`]
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    /// Records removed from the ledger, in deletion order
    pub deleted: Vec<ResourceRecord>,
    /// Resources whose delete call failed; they remain tracked
    pub failed: Vec<(ResourceKey, String)>,
}

impl DeleteOutcome {
    /// Number of resources removed
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

/// Ledger of resources owned by a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Ledger", into = "Ledger")]
pub struct ResourceTracker {
    records: BTreeMap<ResourceKey, ResourceRecord>,
    next_sequence: u64,
}

/// Serialized form: a flat list keeps the JSON readable
#[derive(Serialize, Deserialize)]
struct Ledger {
    #[serde(default)]
    resources: Vec<ResourceRecord>,
}

impl From<Ledger> for ResourceTracker {
    fn from(ledger: Ledger) -> Self {
        let next_sequence = ledger
            .resources
            .iter()
            .map(|r| r.sequence + 1)
            .max()
            .unwrap_or(0);
        let records = ledger
            .resources
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();
        Self {
            records,
            next_sequence,
        }
    }
}

impl From<ResourceTracker> for Ledger {
    fn from(tracker: ResourceTracker) -> Self {
        Self {
            resources: tracker.records.into_values().collect(),
        }
    }
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource applied by `phase`
    ///
    /// Tracking an untracked or `Deleted` resource is a creation event: the
    /// record starts `Pending` with a fresh generation. Tracking a live
    /// resource leaves its record untouched. Returns whether a creation event
    /// happened.
    pub fn track(&mut self, spec: &ResourceSpec, phase: &Phase) -> bool {
        let now = Utc::now();
        if let Some(existing) = self.records.get_mut(&spec.key) {
            if existing.status != ResourceStatus::Deleted {
                return false;
            }
            existing.status = ResourceStatus::Pending;
            existing.phase = phase.id.clone();
            existing.phase_ordinal = phase.ordinal;
            existing.generation += 1;
            existing.sequence = self.next_sequence;
            existing.created_at = now;
            existing.updated_at = now;
            self.next_sequence += 1;
            return true;
        }

        let record = ResourceRecord {
            key: spec.key.clone(),
            status: ResourceStatus::Pending,
            phase: phase.id.clone(),
            phase_ordinal: phase.ordinal,
            generation: 1,
            sequence: self.next_sequence,
            created_at: now,
            updated_at: now,
        };
        self.next_sequence += 1;
        log::trace!("tracking {} for phase {}", spec.key, phase.id);
        self.records.insert(spec.key.clone(), record);
        true
    }

    /// Update the observed status of a tracked resource
    ///
    /// A `Deleted` record can only come back through [`Self::track`].
    pub fn mark_status(&mut self, key: &ResourceKey, status: ResourceStatus) -> Result<()> {
        let record = self
            .records
            .get_mut(key)
            .ok_or_else(|| Error::Untracked(key.to_string()))?;

        if record.status == status {
            return Ok(());
        }
        if record.status == ResourceStatus::Deleted {
            return Err(Error::StatusTransition {
                resource: key.to_string(),
                from: record.status.to_string(),
                to: status.to_string(),
            });
        }

        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Copy of the full ledger, ordered by key
    pub fn snapshot(&self) -> Vec<ResourceRecord> {
        self.records.values().cloned().collect()
    }

    /// Look up one record
    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceRecord> {
        self.records.get(key)
    }

    /// Whether the ledger owns `key`
    pub fn owns(&self, key: &ResourceKey) -> bool {
        self.records.contains_key(key)
    }

    /// Keys of every tracked resource
    pub fn keys(&self) -> BTreeSet<ResourceKey> {
        self.records.keys().cloned().collect()
    }

    /// Records created by one phase
    pub fn records_for_phase(&self, phase_id: &str) -> Vec<&ResourceRecord> {
        self.records.values().filter(|r| r.phase == phase_id).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Delete and untrack every record matching `predicate`
    ///
    /// Later phases go first, and within a phase the most recently created
    /// resource goes first. Records already marked `Deleted` are untracked
    /// without a remote call. A failed delete leaves its record tracked.
    pub fn untrack_and_delete<P>(
        &mut self,
        predicate: P,
        remote: &dyn RemoteState,
        timeout: Duration,
    ) -> DeleteOutcome
    where
        P: Fn(&ResourceRecord) -> bool,
    {
        let mut targets: Vec<ResourceRecord> = self
            .records
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect();
        targets.sort_by(|a, b| {
            b.phase_ordinal
                .cmp(&a.phase_ordinal)
                .then(b.sequence.cmp(&a.sequence))
        });

        let mut outcome = DeleteOutcome::default();
        for record in targets {
            if record.status != ResourceStatus::Deleted {
                match remote.delete(&record.key, timeout) {
                    Ok(existed) => {
                        if !existed {
                            log::debug!("{} was already gone", record.key);
                        }
                    }
                    Err(e) => {
                        log::warn!("failed to delete {}: {e}", record.key);
                        outcome.failed.push((record.key.clone(), e.to_string()));
                        continue;
                    }
                }
            }

            if let Some(mut removed) = self.records.remove(&record.key) {
                removed.status = ResourceStatus::Deleted;
                removed.updated_at = Utc::now();
                outcome.deleted.push(removed);
            }
        }
        outcome
    }

    /// Put a previously removed record back, e.g. when deletion could not be
    /// confirmed remotely
    pub(crate) fn restore(&mut self, mut record: ResourceRecord, status: ResourceStatus) {
        record.status = status;
        record.updated_at = Utc::now();
        self.records.insert(record.key.clone(), record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use crate::types::ApplyOutcome;

    const T: Duration = Duration::from_secs(5);

    fn spec(name: &str) -> ResourceSpec {
        ResourceSpec::new("ConfigMap", "platform", name)
    }

    #[test]
    fn test_track_is_idempotent_for_live_records() {
        let mut tracker = ResourceTracker::new();
        let phase = Phase::new("config", 1, 60);

        assert!(tracker.track(&spec("a"), &phase));
        tracker.mark_status(&spec("a").key, ResourceStatus::Ready).unwrap();
        let before = tracker.snapshot();

        assert!(!tracker.track(&spec("a"), &phase));
        assert_eq!(tracker.snapshot(), before);
    }

    #[test]
    fn test_deleted_cannot_return_to_ready_without_retrack() {
        let mut tracker = ResourceTracker::new();
        let phase = Phase::new("config", 1, 60);
        let key = spec("a").key;

        tracker.track(&spec("a"), &phase);
        tracker.mark_status(&key, ResourceStatus::Deleted).unwrap();

        let err = tracker.mark_status(&key, ResourceStatus::Ready).unwrap_err();
        assert!(matches!(err, Error::StatusTransition { .. }));

        // A new creation event brings it back with a new generation
        assert!(tracker.track(&spec("a"), &phase));
        let record = tracker.get(&key).unwrap();
        assert_eq!(record.generation, 2);
        assert_eq!(record.status, ResourceStatus::Pending);
        tracker.mark_status(&key, ResourceStatus::Ready).unwrap();
    }

    #[test]
    fn test_records_for_phase() {
        let mut tracker = ResourceTracker::new();
        let config = Phase::new("config", 1, 60);
        let apps = Phase::new("apps", 2, 60);
        tracker.track(&spec("a"), &config);
        tracker.track(&spec("b"), &apps);
        tracker.track(&spec("c"), &config);

        let names: Vec<_> = tracker
            .records_for_phase("config")
            .iter()
            .map(|r| r.key.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "c"]);
        assert!(tracker.records_for_phase("gateway").is_empty());
    }

    #[test]
    fn test_mark_untracked_fails() {
        let mut tracker = ResourceTracker::new();
        let err = tracker
            .mark_status(&spec("ghost").key, ResourceStatus::Ready)
            .unwrap_err();
        assert!(matches!(err, Error::Untracked(_)));
    }

    #[test]
    fn test_untrack_and_delete_empties_predicate_set() {
        let cluster = MemoryCluster::new();
        let mut tracker = ResourceTracker::new();
        let first = Phase::new("config", 1, 60);
        let second = Phase::new("apps", 2, 60);

        for (name, phase) in [("a", &first), ("b", &first), ("c", &second)] {
            let s = spec(name);
            assert_eq!(cluster.apply(&s, T).unwrap(), ApplyOutcome::Created);
            tracker.track(&s, phase);
        }

        let outcome = tracker.untrack_and_delete(|_| true, &cluster, T);

        assert_eq!(outcome.deleted_count(), 3);
        assert!(outcome.failed.is_empty());
        assert!(tracker.is_empty());
        assert!(cluster.is_empty());

        // Later phase first, then reverse creation order
        let order: Vec<_> = outcome.deleted.iter().map(|r| r.key.name.as_str()).collect();
        assert_eq!(order, ["c", "b", "a"]);
    }

    #[test]
    fn test_untrack_and_delete_never_touches_untracked() {
        let cluster = MemoryCluster::new();
        cluster.insert_foreign(spec("foreign").key);
        let mut tracker = ResourceTracker::new();
        let phase = Phase::new("config", 1, 60);
        cluster.apply(&spec("ours"), T).unwrap();
        tracker.track(&spec("ours"), &phase);

        let outcome = tracker.untrack_and_delete(|_| true, &cluster, T);

        assert_eq!(outcome.deleted_count(), 1);
        assert!(cluster.contains(&spec("foreign").key));
    }

    #[test]
    fn test_failed_delete_stays_tracked() {
        let cluster = MemoryCluster::new();
        let mut tracker = ResourceTracker::new();
        let phase = Phase::new("config", 1, 60);
        for name in ["a", "stuck"] {
            cluster.apply(&spec(name), T).unwrap();
            tracker.track(&spec(name), &phase);
        }
        cluster.fail_delete(spec("stuck").key);

        let outcome = tracker.untrack_and_delete(|_| true, &cluster, T);

        assert_eq!(outcome.deleted_count(), 1);
        assert_eq!(outcome.failed.len(), 1);
        assert!(tracker.owns(&spec("stuck").key));
    }

    #[test]
    fn test_ledger_round_trips_through_json() {
        let mut tracker = ResourceTracker::new();
        let phase = Phase::new("config", 1, 60);
        tracker.track(&spec("a"), &phase);
        tracker.track(&spec("b"), &phase);

        let json = serde_json::to_string(&tracker).unwrap();
        let mut restored: ResourceTracker = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, tracker);
        // Sequence numbering continues after a reload
        restored.track(&spec("c"), &phase);
        assert_eq!(restored.get(&spec("c").key).unwrap().sequence, 2);
    }
}
