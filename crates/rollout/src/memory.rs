//! In-memory remote state and renderer
//!
//! [`MemoryCluster`] implements [`RemoteState`] over a map guarded by a mutex,
//! with knobs to inject the failure modes a real cluster exhibits (slow
//! readiness, transient apply errors, stuck deletes). [`StaticRenderer`]
//! serves a fixed resource set per phase.

use crate::context::{ConfigRenderer, RemoteState};
use crate::error::{Error, Result};
use crate::plan::{Environment, Phase};
use crate::resource::ResourceSpec;
use crate::types::{ApplyOutcome, ResourceKey, ResourceStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Object {
    spec: ResourceSpec,
    status: ResourceStatus,
    /// Remaining `get` calls before the object turns ready
    polls_until_ready: u32,
}

#[derive(Debug, Clone, Copy)]
enum ApplyFault {
    /// Fail with a transient error this many more times
    Transient(u32),
    /// Always fail with a permanent error
    Permanent,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ResourceKey, Object>,
    identity: Option<String>,
    capabilities: BTreeSet<String>,
    never_ready: BTreeSet<ResourceKey>,
    ready_after: BTreeMap<ResourceKey, u32>,
    apply_faults: BTreeMap<ResourceKey, ApplyFault>,
    delete_faults: BTreeSet<ResourceKey>,
    lingering: BTreeSet<ResourceKey>,
    apply_calls: usize,
    delete_calls: usize,
}

/// In-memory cluster
#[derive(Debug)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// An authenticated, empty cluster
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                identity: Some("system:admin".to_string()),
                ..State::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject credentials on `check_access`
    pub fn unauthenticated(self) -> Self {
        self.lock().identity = None;
        self
    }

    /// Register an installed capability
    pub fn with_capability(self, name: impl Into<String>) -> Self {
        self.lock().capabilities.insert(name.into());
        self
    }

    /// The resource never becomes ready
    pub fn never_ready(&self, key: ResourceKey) {
        self.lock().never_ready.insert(key);
    }

    /// The resource becomes ready after `polls` observations
    pub fn ready_after(&self, key: ResourceKey, polls: u32) {
        self.lock().ready_after.insert(key, polls);
    }

    /// The next `times` applies of the resource fail transiently
    pub fn fail_apply_transient(&self, key: ResourceKey, times: u32) {
        self.lock().apply_faults.insert(key, ApplyFault::Transient(times));
    }

    /// Every apply of the resource fails permanently
    pub fn fail_apply(&self, key: ResourceKey) {
        self.lock().apply_faults.insert(key, ApplyFault::Permanent);
    }

    /// Remove any injected apply fault
    pub fn heal_apply(&self, key: &ResourceKey) {
        self.lock().apply_faults.remove(key);
    }

    /// Every delete of the resource fails
    pub fn fail_delete(&self, key: ResourceKey) {
        self.lock().delete_faults.insert(key);
    }

    /// Deletes of the resource succeed but the object stays visible
    pub fn linger(&self, key: ResourceKey) {
        self.lock().lingering.insert(key);
    }

    /// Create an object the engine did not apply
    pub fn insert_foreign(&self, key: ResourceKey) {
        let spec = ResourceSpec {
            key: key.clone(),
            manifest: None,
            labels: BTreeMap::new(),
        };
        self.lock().objects.insert(
            key,
            Object {
                spec,
                status: ResourceStatus::Ready,
                polls_until_ready: 0,
            },
        );
    }

    /// Remove an object behind the engine's back
    pub fn remove(&self, key: &ResourceKey) {
        self.lock().objects.remove(key);
    }

    /// Force the observed status of an object
    pub fn set_status(&self, key: &ResourceKey, status: ResourceStatus) {
        if let Some(object) = self.lock().objects.get_mut(key) {
            object.status = status;
            object.polls_until_ready = 0;
        }
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    /// Number of `apply` calls received
    pub fn apply_calls(&self) -> usize {
        self.lock().apply_calls
    }

    /// Number of `delete` calls received
    pub fn delete_calls(&self) -> usize {
        self.lock().delete_calls
    }
}

impl RemoteState for MemoryCluster {
    fn apply(&self, spec: &ResourceSpec, _timeout: Duration) -> Result<ApplyOutcome> {
        let mut state = self.lock();
        state.apply_calls += 1;

        match state.apply_faults.get(&spec.key).copied() {
            Some(ApplyFault::Permanent) => {
                return Err(Error::permanent(format!("admission webhook denied {}", spec.key)));
            }
            Some(ApplyFault::Transient(remaining)) if remaining > 0 => {
                state
                    .apply_faults
                    .insert(spec.key.clone(), ApplyFault::Transient(remaining - 1));
                return Err(Error::transient(format!("apiserver unavailable applying {}", spec.key)));
            }
            _ => {}
        }

        let polls = state.ready_after.get(&spec.key).copied().unwrap_or(0);
        if let Some(object) = state.objects.get_mut(&spec.key) {
            if object.spec == *spec {
                return Ok(ApplyOutcome::Unchanged);
            }
            object.spec = spec.clone();
            return Ok(ApplyOutcome::Updated);
        }

        let status = if polls == 0 {
            ResourceStatus::Ready
        } else {
            ResourceStatus::Pending
        };
        state.objects.insert(
            spec.key.clone(),
            Object {
                spec: spec.clone(),
                status,
                polls_until_ready: polls,
            },
        );
        Ok(ApplyOutcome::Created)
    }

    fn get(&self, key: &ResourceKey, _timeout: Duration) -> Result<Option<ResourceStatus>> {
        let mut state = self.lock();
        let never_ready = state.never_ready.contains(key);
        let Some(object) = state.objects.get_mut(key) else {
            return Ok(None);
        };

        if never_ready {
            return Ok(Some(match object.status {
                ResourceStatus::Failed => ResourceStatus::Failed,
                _ => ResourceStatus::Pending,
            }));
        }
        if object.status == ResourceStatus::Pending {
            if object.polls_until_ready <= 1 {
                object.polls_until_ready = 0;
                object.status = ResourceStatus::Ready;
            } else {
                object.polls_until_ready -= 1;
            }
        }
        Ok(Some(object.status))
    }

    fn delete(&self, key: &ResourceKey, _timeout: Duration) -> Result<bool> {
        let mut state = self.lock();
        state.delete_calls += 1;

        if state.delete_faults.contains(key) {
            return Err(Error::permanent(format!("finalizer blocked deletion of {key}")));
        }
        if state.lingering.contains(key) {
            return Ok(state.objects.contains_key(key));
        }
        Ok(state.objects.remove(key).is_some())
    }

    fn check_access(&self, _timeout: Duration) -> Result<String> {
        self.lock()
            .identity
            .clone()
            .ok_or_else(|| Error::permanent("Unauthorized: token expired"))
    }

    fn has_capability(&self, name: &str, _timeout: Duration) -> Result<bool> {
        Ok(self.lock().capabilities.contains(name))
    }
}

/// Renderer serving a fixed resource list per phase id
#[derive(Debug, Default)]
pub struct StaticRenderer {
    phases: BTreeMap<String, Vec<ResourceSpec>>,
    broken: BTreeSet<String>,
}

impl StaticRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: resources for a phase
    pub fn with_phase(mut self, phase: impl Into<String>, resources: Vec<ResourceSpec>) -> Self {
        self.phases.insert(phase.into(), resources);
        self
    }

    /// Builder: rendering this phase fails
    pub fn with_broken_phase(mut self, phase: impl Into<String>) -> Self {
        self.broken.insert(phase.into());
        self
    }
}

impl ConfigRenderer for StaticRenderer {
    fn render(&self, _environment: &Environment, phase: &Phase) -> anyhow::Result<Vec<ResourceSpec>> {
        if self.broken.contains(&phase.id) {
            anyhow::bail!("overlay for phase '{}' references a missing base", phase.id);
        }
        Ok(self.phases.get(&phase.id).cloned().unwrap_or_default())
    }
}
