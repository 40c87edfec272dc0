//! Phase executor - renders, upserts, tracks and waits for one phase
//!
//! Phases are idempotent: apply is an upsert, tracking a live resource twice
//! is a no-op, and readiness is re-observed rather than remembered. That is
//! what lets recovery simply run a phase again.

use crate::backoff::{Backoff, PollOutcome};
use crate::context::{CancelToken, Clock, ConfigRenderer, ProgressCallback, RemoteState};
use crate::error::{Error, Result};
use crate::plan::{Phase, Readiness};
use crate::resource::ResourceSpec;
use crate::run::DeploymentRun;
use crate::types::{ApplySummary, ResourceKey, ResourceStatus};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// How a phase is entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// Normal forward progression; ordinals must increase
    Sequential,
    /// Re-entry driven by the recovery controller
    Recovery,
}

/// Options for phase execution
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Upper bound for a single remote call
    pub request_timeout: Duration,
    /// Retry policy for transient apply errors
    pub apply_backoff: Backoff,
    /// Delay policy between readiness polls
    pub poll_backoff: Backoff,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            apply_backoff: Backoff::new(Duration::from_secs(2), 2.0, Duration::from_secs(30))
                .with_max_attempts(4),
            poll_backoff: Backoff::new(Duration::from_secs(2), 1.5, Duration::from_secs(15)),
        }
    }
}

/// Outcome of one phase
#[derive(Debug)]
pub enum PhaseResult {
    /// Every resource applied and the readiness predicate held
    Completed {
        resources: Vec<ResourceKey>,
        summary: ApplySummary,
        warnings: Vec<String>,
    },
    /// Apply failure, readiness timeout or cancellation; partial resources
    /// stay tracked for recovery
    Failed {
        resources: Vec<ResourceKey>,
        summary: ApplySummary,
        warnings: Vec<String>,
        error: Error,
    },
}

impl PhaseResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn resources(&self) -> &[ResourceKey] {
        match self {
            Self::Completed { resources, .. } | Self::Failed { resources, .. } => resources,
        }
    }

    pub fn summary(&self) -> &ApplySummary {
        match self {
            Self::Completed { summary, .. } | Self::Failed { summary, .. } => summary,
        }
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            Self::Completed { warnings, .. } | Self::Failed { warnings, .. } => warnings,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { error, .. } => Some(error),
        }
    }
}

/// Messages from the readiness worker to the executor
enum Observation {
    Status {
        key: ResourceKey,
        status: Option<ResourceStatus>,
    },
    Round {
        ready: usize,
        total: usize,
    },
}

/// Drives single phases against the remote system
pub struct PhaseExecutor<'a> {
    remote: &'a dyn RemoteState,
    renderer: &'a dyn ConfigRenderer,
    clock: &'a dyn Clock,
    cancel: CancelToken,
    options: ExecutorOptions,
}

impl<'a> PhaseExecutor<'a> {
    pub fn new(
        remote: &'a dyn RemoteState,
        renderer: &'a dyn ConfigRenderer,
        clock: &'a dyn Clock,
        cancel: CancelToken,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            remote,
            renderer,
            clock,
            cancel,
            options,
        }
    }

    pub fn remote(&self) -> &'a dyn RemoteState {
        self.remote
    }

    pub fn renderer(&self) -> &'a dyn ConfigRenderer {
        self.renderer
    }

    pub fn clock(&self) -> &'a dyn Clock {
        self.clock
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Render the desired resources of a phase and check them against the
    /// phase's expected kinds and the environment's resource budget
    pub fn render(&self, run: &DeploymentRun, phase: &Phase) -> Result<Vec<ResourceSpec>> {
        let environment = run.plan().environment();
        let specs = self
            .renderer
            .render(environment, phase)
            .map_err(|e| Error::ConfigRender {
                phase: phase.id.clone(),
                message: format!("{e:#}"),
            })?;

        if let Some(spec) = specs.iter().find(|s| !phase.allows_kind(&s.key.kind)) {
            return Err(Error::ConfigRender {
                phase: phase.id.clone(),
                message: format!("{} is not a kind this phase may produce", spec.key),
            });
        }

        if let Some(budget) = environment.max_resources {
            let new = specs
                .iter()
                .filter(|s| !run.tracker().owns(&s.key))
                .count();
            if run.tracker().len() + new > budget {
                return Err(Error::ConfigRender {
                    phase: phase.id.clone(),
                    message: format!(
                        "environment '{}' allows {budget} resources, phase would bring the run to {}",
                        environment.name,
                        run.tracker().len() + new
                    ),
                });
            }
        }

        Ok(specs)
    }

    /// Execute one phase of `run`
    ///
    /// Render failures propagate as `Err`. Apply failures, readiness timeouts
    /// and cancellation come back as [`PhaseResult::Failed`] with every
    /// resource that was actually applied still tracked.
    pub fn execute_phase(
        &self,
        run: &mut DeploymentRun,
        index: usize,
        entry: Entry,
        progress: &mut dyn ProgressCallback,
    ) -> Result<PhaseResult> {
        let phase = run
            .plan()
            .phases()
            .get(index)
            .cloned()
            .ok_or_else(|| Error::InvalidPlan(format!("no phase at position {index}")))?;

        run.enter_phase(index, entry)?;
        log::info!("phase {} ({}) starting", phase.id, phase.ordinal);

        let specs = match self.render(run, &phase) {
            Ok(specs) => specs,
            Err(e) => {
                run.fail_phase(index, &e.to_string());
                return Err(e);
            }
        };
        progress.on_phase_start(&phase, specs.len());

        let result = self.apply_and_wait(run, &phase, &specs, progress);
        run.finish_phase(index, &result);
        progress.on_phase_complete(&phase, &result);

        match &result {
            PhaseResult::Completed { summary, .. } => log::info!(
                "phase {} completed ({} created, {} updated, {} unchanged)",
                phase.id,
                summary.created,
                summary.updated,
                summary.unchanged
            ),
            PhaseResult::Failed { error, .. } => log::warn!("phase {} failed: {error}", phase.id),
        }
        Ok(result)
    }

    fn apply_and_wait(
        &self,
        run: &mut DeploymentRun,
        phase: &Phase,
        specs: &[ResourceSpec],
        progress: &mut dyn ProgressCallback,
    ) -> PhaseResult {
        let mut summary = ApplySummary::default();
        let mut warnings = Vec::new();
        let mut resources = Vec::with_capacity(specs.len());
        let timeout = run.plan().effective_timeout(phase);
        // Retrying one apply never outlasts the phase
        let apply_backoff = self
            .options
            .apply_backoff
            .clone()
            .with_deadline(self.options.apply_backoff.deadline.map_or(timeout, |d| d.min(timeout)));

        if specs.is_empty() {
            return PhaseResult::Completed {
                resources,
                summary,
                warnings,
            };
        }

        for spec in specs {
            if self.cancel.is_cancelled() {
                return PhaseResult::Failed {
                    resources,
                    summary,
                    warnings,
                    error: Error::Cancelled {
                        phase: phase.id.clone(),
                    },
                };
            }

            let applied = apply_backoff.retry(self.clock, &self.cancel, || {
                self.remote.apply(spec, self.options.request_timeout)
            });

            match applied {
                Ok(retried) => {
                    let tracker = run.tracker_mut();
                    let created = tracker.track(spec, phase);
                    let was_failed = tracker
                        .get(&spec.key)
                        .is_some_and(|r| r.status == ResourceStatus::Failed);
                    if !created && (retried.value.is_change() || was_failed) {
                        // Readiness must be observed again
                        let _ = tracker.mark_status(&spec.key, ResourceStatus::Pending);
                    }
                    if retried.was_retried() {
                        warnings.push(format!(
                            "apply of {} succeeded after {} attempts",
                            spec.key, retried.attempts
                        ));
                    }
                    summary.add(retried.value);
                    resources.push(spec.key.clone());
                    progress.on_resource_applied(&spec.key, retried.value);
                }
                Err(e) => {
                    summary.failed += 1;
                    self.track_partial(run, spec, phase, &mut resources);
                    return PhaseResult::Failed {
                        resources,
                        summary,
                        warnings,
                        error: Error::Apply {
                            resource: spec.key.to_string(),
                            transient: e.is_retryable(),
                            message: e.to_string(),
                        },
                    };
                }
            }
        }

        if phase.readiness == Readiness::Skip {
            return PhaseResult::Completed {
                resources,
                summary,
                warnings,
            };
        }

        match self.wait_ready(run, phase, &resources, timeout, progress) {
            Ok(PollOutcome::Satisfied { polls }) => {
                log::debug!("phase {} ready after {polls} poll(s)", phase.id);
                PhaseResult::Completed {
                    resources,
                    summary,
                    warnings,
                }
            }
            Ok(PollOutcome::TimedOut { elapsed }) => {
                self.refresh_statuses(run, &resources);
                let pending = resources
                    .iter()
                    .filter(|k| {
                        run.tracker()
                            .get(k)
                            .is_none_or(|r| !satisfies(phase.readiness, Some(r.status)))
                    })
                    .map(ToString::to_string)
                    .collect();
                PhaseResult::Failed {
                    resources,
                    summary,
                    warnings,
                    error: Error::ReadinessTimeout {
                        phase: phase.id.clone(),
                        elapsed,
                        pending,
                    },
                }
            }
            Ok(PollOutcome::Cancelled) => PhaseResult::Failed {
                resources,
                summary,
                warnings,
                error: Error::Cancelled {
                    phase: phase.id.clone(),
                },
            },
            Err(error) => PhaseResult::Failed {
                resources,
                summary,
                warnings,
                error,
            },
        }
    }

    /// After a failed apply, track the resource only if it actually exists
    fn track_partial(
        &self,
        run: &mut DeploymentRun,
        spec: &ResourceSpec,
        phase: &Phase,
        resources: &mut Vec<ResourceKey>,
    ) {
        match self.remote.get(&spec.key, self.options.request_timeout) {
            Ok(Some(_)) => {
                let tracker = run.tracker_mut();
                tracker.track(spec, phase);
                let _ = tracker.mark_status(&spec.key, ResourceStatus::Failed);
                resources.push(spec.key.clone());
            }
            Ok(None) => {}
            Err(e) => log::debug!("could not observe {} after failed apply: {e}", spec.key),
        }
    }

    /// Record the current status of every phase resource after a timeout
    fn refresh_statuses(&self, run: &mut DeploymentRun, keys: &[ResourceKey]) {
        for key in keys {
            match self.remote.get(key, self.options.request_timeout) {
                Ok(status) => {
                    let status = status.unwrap_or(ResourceStatus::Pending);
                    if let Err(e) = run.tracker_mut().mark_status(key, status) {
                        log::warn!("ignoring observation for {key}: {e}");
                    }
                }
                Err(e) => log::debug!("could not observe {key} after timeout: {e}"),
            }
        }
    }

    /// Poll readiness on a background worker; this thread stays the only
    /// writer of the tracker
    ///
    /// `AllReady` phases probe through [`RemoteState::wait_ready`] and only
    /// report resources that reached `Ready`.
    fn wait_ready(
        &self,
        run: &mut DeploymentRun,
        phase: &Phase,
        keys: &[ResourceKey],
        timeout: Duration,
        progress: &mut dyn ProgressCallback,
    ) -> Result<PollOutcome> {
        let (tx, rx) = mpsc::channel::<Observation>();
        let remote = self.remote;
        let clock = self.clock;
        let cancel = self.cancel.clone();
        let backoff = &self.options.poll_backoff;
        let request_timeout = self.options.request_timeout.min(timeout);
        let readiness = phase.readiness;

        thread::scope(|scope| {
            let worker = scope.spawn(move || {
                backoff.poll(clock, &cancel, timeout, || {
                    let mut ready = 0;
                    for key in keys {
                        let status = if readiness == Readiness::AllReady {
                            if !remote.wait_ready(key, request_timeout)? {
                                continue;
                            }
                            Some(ResourceStatus::Ready)
                        } else {
                            remote.get(key, request_timeout)?
                        };
                        if satisfies(readiness, status) {
                            ready += 1;
                        }
                        // Receiver only disappears if the executor is gone
                        let _ = tx.send(Observation::Status {
                            key: key.clone(),
                            status,
                        });
                    }
                    let _ = tx.send(Observation::Round {
                        ready,
                        total: keys.len(),
                    });
                    Ok(ready == keys.len())
                })
            });

            for observation in rx {
                match observation {
                    Observation::Status { key, status } => {
                        let status = status.unwrap_or(ResourceStatus::Pending);
                        if let Err(e) = run.tracker_mut().mark_status(&key, status) {
                            log::warn!("ignoring observation for {key}: {e}");
                        }
                    }
                    Observation::Round { ready, total } => {
                        progress.on_readiness_poll(phase, ready, total);
                    }
                }
            }

            worker.join().map_err(|_| {
                Error::permanent(format!("readiness worker for phase '{}' panicked", phase.id))
            })
        })
    }
}

/// Whether an observed status satisfies a readiness predicate
pub(crate) fn satisfies(readiness: Readiness, status: Option<ResourceStatus>) -> bool {
    match readiness {
        Readiness::AllReady => status == Some(ResourceStatus::Ready),
        Readiness::Exists => matches!(status, Some(s) if s != ResourceStatus::Failed),
        Readiness::Skip => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, NoProgress};
    use crate::memory::{MemoryCluster, StaticRenderer};
    use crate::plan::{DeploymentPlan, Environment};
    use crate::types::{ApplyOutcome, PhaseStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn plan(phases: Vec<Phase>) -> DeploymentPlan {
        DeploymentPlan::new("platform", Environment::new("development"), phases).unwrap()
    }

    fn fast_options() -> ExecutorOptions {
        ExecutorOptions {
            request_timeout: Duration::from_secs(5),
            apply_backoff: Backoff::new(Duration::from_millis(100), 2.0, Duration::from_secs(1))
                .with_max_attempts(3),
            poll_backoff: Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(10)),
        }
    }

    fn workload(name: &str) -> ResourceSpec {
        ResourceSpec::new("Deployment", "platform", name)
    }

    #[test]
    fn test_phase_completes_when_ready() {
        let cluster = MemoryCluster::new();
        let renderer = StaticRenderer::new().with_phase("apps", vec![workload("engine")]);
        cluster.ready_after(workload("engine").key, 3);
        let clock = ManualClock::new();
        let executor =
            PhaseExecutor::new(&cluster, &renderer, &clock, CancelToken::new(), fast_options());
        let mut run = DeploymentRun::new(plan(vec![Phase::new("apps", 1, 60)]));
        run.begin().unwrap();

        let result = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap();

        assert!(result.is_completed());
        assert_eq!(result.summary().created, 1);
        let record = run.tracker().get(&workload("engine").key).unwrap();
        assert_eq!(record.status, ResourceStatus::Ready);
    }

    #[test]
    fn test_empty_phase_is_trivially_successful() {
        let cluster = MemoryCluster::new();
        let renderer = StaticRenderer::new();
        let clock = ManualClock::new();
        let executor =
            PhaseExecutor::new(&cluster, &renderer, &clock, CancelToken::new(), fast_options());
        let mut run = DeploymentRun::new(plan(vec![Phase::new("empty", 1, 60)]));
        run.begin().unwrap();

        let result = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap();

        assert!(result.is_completed());
        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert!(run.tracker().is_empty());
    }

    #[test]
    fn test_timeout_is_bounded() {
        let cluster = MemoryCluster::new();
        let renderer = StaticRenderer::new().with_phase("apps", vec![workload("stuck")]);
        cluster.never_ready(workload("stuck").key);
        let clock = ManualClock::new();
        let executor =
            PhaseExecutor::new(&cluster, &renderer, &clock, CancelToken::new(), fast_options());
        let mut run = DeploymentRun::new(plan(vec![Phase::new("apps", 1, 90)]));
        run.begin().unwrap();

        let result = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap();

        match result.error() {
            Some(Error::ReadinessTimeout { elapsed, pending, .. }) => {
                assert!(*elapsed >= Duration::from_secs(90));
                assert_eq!(pending, &vec![workload("stuck").key.to_string()]);
            }
            other => panic!("expected readiness timeout, got {other:?}"),
        }
        let elapsed = clock.elapsed();
        assert!(elapsed >= Duration::from_secs(90));
        assert!(elapsed < Duration::from_secs(91));
        // Partial state stays visible to recovery
        assert!(run.tracker().owns(&workload("stuck").key));
    }

    #[test]
    fn test_timeout_scaled_by_environment() {
        let cluster = MemoryCluster::new();
        let renderer = StaticRenderer::new().with_phase("apps", vec![workload("stuck")]);
        cluster.never_ready(workload("stuck").key);
        let clock = ManualClock::new();
        let executor =
            PhaseExecutor::new(&cluster, &renderer, &clock, CancelToken::new(), fast_options());
        let mut env = Environment::new("production");
        env.timeout_scale = 2.0;
        let plan = DeploymentPlan::new("platform", env, vec![Phase::new("apps", 1, 30)]).unwrap();
        let mut run = DeploymentRun::new(plan);
        run.begin().unwrap();

        executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap();

        assert_eq!(clock.elapsed(), Duration::from_secs(60));
    }

    #[test]
    fn test_transient_apply_retried_and_warned() {
        let cluster = MemoryCluster::new();
        let renderer = StaticRenderer::new().with_phase("apps", vec![workload("engine")]);
        cluster.fail_apply_transient(workload("engine").key, 2);
        let clock = ManualClock::new();
        let executor =
            PhaseExecutor::new(&cluster, &renderer, &clock, CancelToken::new(), fast_options());
        let mut run = DeploymentRun::new(plan(vec![Phase::new("apps", 1, 60)]));
        run.begin().unwrap();

        let result = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap();

        assert!(result.is_completed());
        assert_eq!(result.warnings().len(), 1);
        assert!(result.warnings()[0].contains("after 3 attempts"));
    }

    #[test]
    fn test_permanent_apply_failure_keeps_partial_resources() {
        let cluster = MemoryCluster::new();
        let renderer = StaticRenderer::new()
            .with_phase("apps", vec![workload("first"), workload("denied"), workload("never")]);
        cluster.fail_apply(workload("denied").key);
        let clock = ManualClock::new();
        let executor =
            PhaseExecutor::new(&cluster, &renderer, &clock, CancelToken::new(), fast_options());
        let mut run = DeploymentRun::new(plan(vec![Phase::new("apps", 1, 60)]));
        run.begin().unwrap();

        let result = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap();

        assert!(matches!(result.error(), Some(Error::Apply { transient: false, .. })));
        assert!(run.tracker().owns(&workload("first").key));
        assert!(!run.tracker().owns(&workload("denied").key));
        assert!(!run.tracker().owns(&workload("never").key));
        // Only one apply attempt for a permanent error
        assert_eq!(cluster.apply_calls(), 2);
    }

    #[test]
    fn test_render_failure_propagates() {
        let cluster = MemoryCluster::new();
        let renderer = StaticRenderer::new().with_broken_phase("apps");
        let clock = ManualClock::new();
        let executor =
            PhaseExecutor::new(&cluster, &renderer, &clock, CancelToken::new(), fast_options());
        let mut run = DeploymentRun::new(plan(vec![Phase::new("apps", 1, 60)]));
        run.begin().unwrap();

        let err = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap_err();

        assert!(matches!(err, Error::ConfigRender { .. }));
        assert_eq!(cluster.apply_calls(), 0);
    }

    #[test]
    fn test_unexpected_kind_rejected() {
        let cluster = MemoryCluster::new();
        let renderer = StaticRenderer::new().with_phase("storage", vec![workload("engine")]);
        let clock = ManualClock::new();
        let executor =
            PhaseExecutor::new(&cluster, &renderer, &clock, CancelToken::new(), fast_options());
        let phase = Phase::new("storage", 1, 60).expecting(["PersistentVolumeClaim"]);
        let mut run = DeploymentRun::new(plan(vec![phase]));
        run.begin().unwrap();

        let err = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap_err();
        assert!(err.to_string().contains("not a kind this phase may produce"));
    }

    #[test]
    fn test_resource_budget_enforced() {
        let cluster = MemoryCluster::new();
        let renderer =
            StaticRenderer::new().with_phase("apps", vec![workload("a"), workload("b")]);
        let clock = ManualClock::new();
        let executor =
            PhaseExecutor::new(&cluster, &renderer, &clock, CancelToken::new(), fast_options());
        let mut env = Environment::new("development");
        env.max_resources = Some(1);
        let plan = DeploymentPlan::new("platform", env, vec![Phase::new("apps", 1, 60)]).unwrap();
        let mut run = DeploymentRun::new(plan);
        run.begin().unwrap();

        let err = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, Error::ConfigRender { .. }));
    }

    #[test]
    fn test_cancelled_before_apply() {
        let cluster = MemoryCluster::new();
        let renderer = StaticRenderer::new().with_phase("apps", vec![workload("engine")]);
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let executor = PhaseExecutor::new(&cluster, &renderer, &clock, cancel, fast_options());
        let mut run = DeploymentRun::new(plan(vec![Phase::new("apps", 1, 60)]));
        run.begin().unwrap();

        let result = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap();

        assert!(matches!(result.error(), Some(Error::Cancelled { .. })));
        assert!(run.tracker().is_empty());
        assert_eq!(cluster.apply_calls(), 0);
    }

    #[test]
    fn test_exists_readiness_accepts_pending() {
        let cluster = MemoryCluster::new();
        let renderer = StaticRenderer::new().with_phase("apps", vec![workload("engine")]);
        cluster.never_ready(workload("engine").key);
        let clock = ManualClock::new();
        let executor =
            PhaseExecutor::new(&cluster, &renderer, &clock, CancelToken::new(), fast_options());
        let phase = Phase::new("apps", 1, 60).with_readiness(Readiness::Exists);
        let mut run = DeploymentRun::new(plan(vec![phase]));
        run.begin().unwrap();

        let result = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap();
        assert!(result.is_completed());
    }

    #[test]
    fn test_timeout_records_observed_failure() {
        let cluster = MemoryCluster::new();
        let spec = workload("crashing");
        cluster.apply(&spec, Duration::from_secs(5)).unwrap();
        cluster.set_status(&spec.key, ResourceStatus::Failed);
        cluster.never_ready(spec.key.clone());
        let renderer = StaticRenderer::new().with_phase("apps", vec![spec.clone()]);
        let clock = ManualClock::new();
        let executor =
            PhaseExecutor::new(&cluster, &renderer, &clock, CancelToken::new(), fast_options());
        let mut run = DeploymentRun::new(plan(vec![Phase::new("apps", 1, 30)]));
        run.begin().unwrap();

        let result = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap();

        assert!(matches!(result.error(), Some(Error::ReadinessTimeout { .. })));
        assert_eq!(result.summary().unchanged, 1);
        assert_eq!(run.tracker().get(&spec.key).unwrap().status, ResourceStatus::Failed);
    }

    #[test]
    fn test_apply_retries_stop_at_phase_timeout() {
        let cluster = MemoryCluster::new();
        let renderer = StaticRenderer::new().with_phase("apps", vec![workload("engine")]);
        cluster.fail_apply_transient(workload("engine").key, 3);
        let clock = ManualClock::new();
        let options = ExecutorOptions {
            apply_backoff: Backoff::new(Duration::from_secs(2), 2.0, Duration::from_secs(10))
                .with_max_attempts(5),
            ..fast_options()
        };
        let executor = PhaseExecutor::new(&cluster, &renderer, &clock, CancelToken::new(), options);
        let mut run = DeploymentRun::new(plan(vec![Phase::new("apps", 1, 1)]));
        run.begin().unwrap();

        let result = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut NoProgress)
            .unwrap();

        assert!(matches!(result.error(), Some(Error::Apply { transient: true, .. })));
        assert_eq!(cluster.apply_calls(), 2);
        assert_eq!(clock.elapsed(), Duration::from_secs(1));
    }

    /// Holds the second readiness round until the token is cancelled
    struct GatedCluster<'a> {
        inner: &'a MemoryCluster,
        cancel: CancelToken,
        gets: AtomicUsize,
        keys: usize,
    }

    impl RemoteState for GatedCluster<'_> {
        fn apply(&self, spec: &ResourceSpec, timeout: Duration) -> Result<ApplyOutcome> {
            self.inner.apply(spec, timeout)
        }

        fn get(&self, key: &ResourceKey, timeout: Duration) -> Result<Option<ResourceStatus>> {
            if self.gets.fetch_add(1, Ordering::SeqCst) == self.keys {
                let started = Instant::now();
                while !self.cancel.is_cancelled() && started.elapsed() < Duration::from_secs(5) {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            self.inner.get(key, timeout)
        }

        fn delete(&self, key: &ResourceKey, timeout: Duration) -> Result<bool> {
            self.inner.delete(key, timeout)
        }

        fn check_access(&self, timeout: Duration) -> Result<String> {
            self.inner.check_access(timeout)
        }

        fn has_capability(&self, name: &str, timeout: Duration) -> Result<bool> {
            self.inner.has_capability(name, timeout)
        }
    }

    struct CancelOnFirstPoll {
        cancel: CancelToken,
        polls: usize,
    }

    impl ProgressCallback for CancelOnFirstPoll {
        fn on_phase_start(&mut self, _phase: &Phase, _resources: usize) {}
        fn on_resource_applied(&mut self, _key: &ResourceKey, _outcome: ApplyOutcome) {}
        fn on_readiness_poll(&mut self, _phase: &Phase, _ready: usize, _total: usize) {
            self.polls += 1;
            self.cancel.cancel();
        }
        fn on_phase_complete(&mut self, _phase: &Phase, _result: &PhaseResult) {}
    }

    #[test]
    fn test_cancel_during_readiness_keeps_applied_resources() {
        let cluster = MemoryCluster::new();
        cluster.never_ready(workload("stuck").key);
        let cancel = CancelToken::new();
        let gated = GatedCluster {
            inner: &cluster,
            cancel: cancel.clone(),
            gets: AtomicUsize::new(0),
            keys: 2,
        };
        let renderer = StaticRenderer::new()
            .with_phase("apps", vec![workload("engine"), workload("stuck")]);
        let clock = ManualClock::new();
        let executor =
            PhaseExecutor::new(&gated, &renderer, &clock, cancel.clone(), fast_options());
        let mut run = DeploymentRun::new(plan(vec![Phase::new("apps", 1, 600)]));
        run.begin().unwrap();
        let mut progress = CancelOnFirstPoll { cancel, polls: 0 };

        let result = executor
            .execute_phase(&mut run, 0, Entry::Sequential, &mut progress)
            .unwrap();

        assert!(matches!(result.error(), Some(Error::Cancelled { .. })));
        assert_eq!(
            result.resources(),
            &[workload("engine").key, workload("stuck").key]
        );
        for key in result.resources() {
            assert!(run.tracker().owns(key), "{key} should stay tracked");
        }
        assert_eq!(
            run.tracker().get(&workload("engine").key).unwrap().status,
            ResourceStatus::Ready
        );
        assert_eq!(run.phases()[0].status, PhaseStatus::Failed);
        assert!(progress.polls >= 1);
        assert!(clock.elapsed() < Duration::from_secs(600));
    }
}
