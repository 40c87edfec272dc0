//! Provider traits and execution context
//!
//! These traits let the engine run without depending on a specific cluster
//! client, manifest renderer, terminal UI or time source.

use crate::error::Result;
use crate::executor::PhaseResult;
use crate::plan::{Environment, Phase};
use crate::resource::ResourceSpec;
use crate::types::{ApplyOutcome, ResourceKey, ResourceStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Narrow interface to the remote state store (the cluster API)
///
/// Every call carries an explicit timeout. Implementations report transient
/// failures with [`crate::Error::transient`] so the engine can retry them.
pub trait RemoteState: Send + Sync {
    /// Upsert a resource: create if absent, reconcile if present
    fn apply(&self, spec: &ResourceSpec, timeout: Duration) -> Result<ApplyOutcome>;

    /// Observe a resource; `None` means it does not exist
    ///
    /// Implementations never return [`ResourceStatus::Deleted`].
    fn get(&self, key: &ResourceKey, timeout: Duration) -> Result<Option<ResourceStatus>>;

    /// Delete a resource; returns whether it existed
    fn delete(&self, key: &ResourceKey, timeout: Duration) -> Result<bool>;

    /// One bounded readiness probe; `false` covers absent, pending and failed
    fn wait_ready(&self, key: &ResourceKey, timeout: Duration) -> Result<bool> {
        Ok(self.get(key, timeout)? == Some(ResourceStatus::Ready))
    }

    /// Verify credentials; returns the authenticated identity
    fn check_access(&self, timeout: Duration) -> Result<String>;

    /// Whether a required capability (API group, CRD, operator) is installed
    fn has_capability(&self, name: &str, timeout: Duration) -> Result<bool>;
}

/// External provider of desired state
///
/// Implementations must be side-effect free: the engine may render the same
/// phase several times (deploy, recovery, validation).
pub trait ConfigRenderer: Send + Sync {
    /// Resources the given phase should produce in the given environment
    fn render(&self, environment: &Environment, phase: &Phase) -> anyhow::Result<Vec<ResourceSpec>>;
}

/// Progress callback for phase execution
///
/// Implement this trait to receive progress updates during a run.
pub trait ProgressCallback: Send {
    /// Called when a phase starts, with the number of rendered resources
    fn on_phase_start(&mut self, phase: &Phase, resources: usize);

    /// Called after each resource is upserted
    fn on_resource_applied(&mut self, key: &ResourceKey, outcome: ApplyOutcome);

    /// Called after each readiness poll round
    fn on_readiness_poll(&mut self, phase: &Phase, ready: usize, total: usize);

    /// Called when a phase finishes, successfully or not
    fn on_phase_complete(&mut self, phase: &Phase, result: &PhaseResult);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_phase_start(&mut self, _phase: &Phase, _resources: usize) {}
    fn on_resource_applied(&mut self, _key: &ResourceKey, _outcome: ApplyOutcome) {}
    fn on_readiness_poll(&mut self, _phase: &Phase, _ready: usize, _total: usize) {}
    fn on_phase_complete(&mut self, _phase: &Phase, _result: &PhaseResult) {}
}

/// Time source used by polling and retry loops
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;

    /// Block the calling thread for `duration`
    fn sleep(&self, duration: Duration);
}

/// Wall clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Manually driven clock; `sleep` advances time instantly
///
/// Lets tests assert timeout bounds without waiting in real time.
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward
    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += duration;
    }

    /// Total simulated time elapsed since creation
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Cooperative cancellation flag
///
/// Cloned tokens share state. A token can additionally observe a process-wide
/// flag (e.g. set from a SIGINT handler).
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    signal: Option<&'static AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that also trips when `signal` is set
    pub fn with_signal(signal: &'static AtomicBool) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            signal: Some(signal),
        }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.signal.is_some_and(|s| s.load(Ordering::SeqCst))
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
