//! Deployment runs and the orchestrator that drives them
//!
//! A [`DeploymentRun`] is the unit of isolation: it owns its plan, its
//! resource ledger and everything observed along the way. The
//! [`Orchestrator`] walks a run through its lifecycle:
//!
//! ```text
//! Initialized ─► PrerequisitesPassed ─► Executing{0..n} ─► Validated ─► Finished
//!      │                                     │    ▲                        │
//!      └─► Finished(aborted)                 ▼    │                        │
//!                                          Reconciling ◄───────────────────┘
//! ```

use crate::backoff::PollOutcome;
use crate::context::{CancelToken, Clock, ConfigRenderer, ProgressCallback, RemoteState, SystemClock};
use crate::error::{Error, Result};
use crate::executor::{Entry, ExecutorOptions, PhaseExecutor, PhaseResult};
use crate::plan::DeploymentPlan;
use crate::prereq::{self, PrerequisiteReport, PrerequisiteSettings, run_prerequisites};
use crate::recovery::{RecoveryController, RecoveryOptions, RecoveryResult};
use crate::report::{Report, ReportSink};
use crate::tracker::ResourceTracker;
use crate::types::{ApplySummary, PhaseStatus, ResourceKey, ResourceStatus, RunStatus};
use crate::validation::{self, ValidationCheck, ValidationOptions, ValidationReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Initialized,
    PrerequisitesPassed,
    /// Running the phase at this plan position
    Executing { phase: usize, recovery: bool },
    Validated,
    Reconciling,
    Finished { status: RunStatus },
}

impl RunState {
    /// Whether the state machine allows moving to `next`
    ///
    /// Sequential execution only moves forward through the plan. Going back
    /// to an earlier phase requires passing through `Reconciling`.
    pub fn can_transition(&self, next: &Self) -> bool {
        use RunState::{Executing, Finished, Initialized, PrerequisitesPassed, Reconciling, Validated};

        match (*self, *next) {
            (Initialized, PrerequisitesPassed) => true,
            (Initialized, Finished { status }) => status == RunStatus::Aborted,
            (PrerequisitesPassed, Executing { recovery, .. }) => !recovery,
            (
                Executing {
                    phase: from,
                    recovery: a,
                },
                Executing {
                    phase: to,
                    recovery: b,
                },
            ) => a == b && to > from,
            (Executing { .. } | Reconciling, Validated) => true,
            (Executing { .. } | Validated, Reconciling) => true,
            (Reconciling, Executing { recovery, .. }) => recovery,
            (PrerequisitesPassed | Executing { .. } | Validated | Reconciling, Finished { status }) => {
                status != RunStatus::Aborted
            }
            (Finished { status }, Reconciling) => status != RunStatus::Aborted,
            _ => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::PrerequisitesPassed => write!(f, "prerequisites passed"),
            Self::Executing {
                phase,
                recovery: false,
            } => write!(f, "executing phase #{}", phase + 1),
            Self::Executing {
                phase,
                recovery: true,
            } => write!(f, "re-executing phase #{}", phase + 1),
            Self::Validated => write!(f, "validated"),
            Self::Reconciling => write!(f, "reconciling"),
            Self::Finished { status } => write!(f, "finished ({status})"),
        }
    }
}

/// Why a run did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    Prerequisite { check: String, message: String },
    Phase { phase: String, message: String },
    Validation { checks: Vec<String> },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prerequisite { check, message } => {
                write!(f, "prerequisite '{check}' failed: {message}")
            }
            Self::Phase { phase, message } => write!(f, "phase '{phase}' failed: {message}"),
            Self::Validation { checks } => {
                write!(f, "critical checks failed: {}", checks.join(", "))
            }
        }
    }
}

/// Per-phase bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub id: String,
    pub ordinal: u32,
    pub status: PhaseStatus,
    /// How many times the phase was entered
    #[serde(default)]
    pub executions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub summary: ApplySummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl PhaseRecord {
    fn not_started(id: &str, ordinal: u32) -> Self {
        Self {
            id: id.to_string(),
            ordinal,
            status: PhaseStatus::NotStarted,
            executions: 0,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            summary: ApplySummary::default(),
            resources: Vec::new(),
            error: None,
            warnings: Vec::new(),
        }
    }

    fn close(&mut self, status: PhaseStatus) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|start| (now - start).num_milliseconds());
    }
}

/// One deployment of one plan into one environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRun {
    id: String,
    plan: Arc<DeploymentPlan>,
    state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause: Option<FailureCause>,
    started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_phase: Option<usize>,
    phases: Vec<PhaseRecord>,
    #[serde(default)]
    tracker: ResourceTracker,
    #[serde(default)]
    pub prerequisites: PrerequisiteReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recoveries: Vec<RecoveryResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Report produced when the current lifecycle pass finished
    #[serde(skip)]
    report: Option<Report>,
}

impl DeploymentRun {
    /// Start a run with an empty ledger
    pub fn new(plan: impl Into<Arc<DeploymentPlan>>) -> Self {
        let plan = plan.into();
        let started_at = Utc::now();
        let phases = plan
            .phases()
            .iter()
            .map(|p| PhaseRecord::not_started(&p.id, p.ordinal))
            .collect();

        Self {
            id: run_id(&plan, started_at),
            plan,
            state: RunState::Initialized,
            status: None,
            cause: None,
            started_at,
            finished_at: None,
            current_phase: None,
            phases,
            tracker: ResourceTracker::new(),
            prerequisites: PrerequisiteReport::default(),
            validation: None,
            recoveries: Vec::new(),
            warnings: Vec::new(),
            report: None,
        }
    }

    /// Builder: inherit the ledger of an earlier run in the same environment
    pub fn with_tracker(mut self, tracker: ResourceTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plan(&self) -> &DeploymentPlan {
        &self.plan
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Terminal status once finished
    pub fn status(&self) -> Option<RunStatus> {
        self.status
    }

    pub fn cause(&self) -> Option<&FailureCause> {
        self.cause.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Position of the phase executed last
    pub fn current_phase(&self) -> Option<usize> {
        self.current_phase
    }

    pub fn phases(&self) -> &[PhaseRecord] {
        &self.phases
    }

    pub fn phase_record(&self, id: &str) -> Option<&PhaseRecord> {
        self.plan.phase_index(id).and_then(|i| self.phases.get(i))
    }

    /// First phase currently marked failed
    pub fn failed_phase(&self) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.status == PhaseStatus::Failed)
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    pub(crate) fn tracker_mut(&mut self) -> &mut ResourceTracker {
        &mut self.tracker
    }

    /// Move to `next`, enforcing the lifecycle rules
    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition(&next) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        log::debug!("run {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Record that the prerequisite gate passed
    pub fn begin(&mut self) -> Result<()> {
        self.transition(RunState::PrerequisitesPassed)
    }

    /// Reopen a finished run for reconciliation
    pub fn reopen(&mut self) -> Result<()> {
        if self.state != RunState::Reconciling {
            self.transition(RunState::Reconciling)?;
        }
        self.status = None;
        self.cause = None;
        self.finished_at = None;
        self.report = None;
        Ok(())
    }

    pub(crate) fn set_cause(&mut self, cause: FailureCause) {
        self.cause = Some(cause);
    }

    pub(crate) fn enter_phase(&mut self, index: usize, entry: Entry) -> Result<()> {
        self.transition(RunState::Executing {
            phase: index,
            recovery: entry == Entry::Recovery,
        })?;
        self.current_phase = Some(index);

        let record = self
            .phases
            .get_mut(index)
            .ok_or_else(|| Error::InvalidPlan(format!("no phase at position {index}")))?;
        record.status = PhaseStatus::Running;
        record.executions += 1;
        record.started_at = Some(Utc::now());
        record.finished_at = None;
        record.duration_ms = None;
        record.error = None;
        record.warnings.clear();
        Ok(())
    }

    pub(crate) fn finish_phase(&mut self, index: usize, result: &PhaseResult) {
        let Some(record) = self.phases.get_mut(index) else {
            return;
        };
        record.close(if result.is_completed() {
            PhaseStatus::Completed
        } else {
            PhaseStatus::Failed
        });
        record.summary = *result.summary();
        record.resources = result.resources().to_vec();
        record.error = result.error().map(ToString::to_string);
        record.warnings = result.warnings().to_vec();

        let phase = record.id.clone();
        self.warnings
            .extend(result.warnings().iter().map(|w| format!("phase {phase}: {w}")));
    }

    pub(crate) fn fail_phase(&mut self, index: usize, message: &str) {
        if let Some(record) = self.phases.get_mut(index) {
            record.close(PhaseStatus::Failed);
            record.error = Some(message.to_string());
        }
    }

    /// Whether the current lifecycle pass produced its report
    pub fn is_finalized(&self) -> bool {
        self.report.is_some()
    }

    /// Report of the current lifecycle pass, once finalized
    pub fn report(&self) -> Option<&Report> {
        self.report.as_ref()
    }

    /// Finish the run and produce its report
    ///
    /// Only the first call has an effect; later calls return the first
    /// report unchanged.
    pub fn finalize(&mut self, status: RunStatus) -> Result<Report> {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }

        self.transition(RunState::Finished { status })?;
        self.status = Some(status);
        self.finished_at = Some(Utc::now());
        if status == RunStatus::Succeeded {
            self.cause = None;
        }

        let report = Report::from_run(self);
        self.report = Some(report.clone());
        log::info!("run {} finished: {status}", self.id);
        Ok(report)
    }
}

/// `<env>-<utc timestamp>-<8 hex digits>`
fn run_id(plan: &DeploymentPlan, at: DateTime<Utc>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(plan.name().as_bytes());
    hasher.update(plan.environment().name.as_bytes());
    hasher.update(&at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    let hash = hasher.finalize().to_hex();

    format!(
        "{}-{}-{}",
        plan.environment().name,
        at.format("%Y%m%d%H%M%S"),
        &hash.as_str()[..8]
    )
}

/// Result of [`Orchestrator::deploy`] and [`Orchestrator::recover`]
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub status: RunStatus,
    pub cause: Option<FailureCause>,
    pub report: Report,
}

impl DeployOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Result of [`Orchestrator::teardown`]
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// Ledger size when teardown started
    pub tracked_before: usize,
    /// Resources deleted and confirmed absent
    pub deleted: Vec<ResourceKey>,
    /// Resources whose delete call failed
    pub failed: Vec<(ResourceKey, String)>,
    /// Deleted resources still visible remotely after the wait
    pub lingering: Vec<ResourceKey>,
    /// Resources still tracked afterwards
    pub remaining: Vec<ResourceKey>,
}

impl TeardownReport {
    /// Zero-leak: the ledger is empty and every tracked resource was removed
    pub fn is_clean(&self) -> bool {
        self.remaining.is_empty() && self.deleted.len() == self.tracked_before
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_clean() {
            Ok(self)
        } else {
            Err(Error::TeardownLeak {
                remaining: self.remaining.iter().map(ToString::to_string).collect(),
            })
        }
    }
}

/// Options for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub executor: ExecutorOptions,
    pub recovery: RecoveryOptions,
    pub validation: ValidationOptions,
    pub prerequisites: PrerequisiteSettings,
    /// Reconcile automatically after a recoverable phase failure
    pub auto_recover: bool,
    /// How long teardown waits for deleted resources to disappear
    pub teardown_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            executor: ExecutorOptions::default(),
            recovery: RecoveryOptions::default(),
            validation: ValidationOptions::default(),
            prerequisites: PrerequisiteSettings::default(),
            auto_recover: true,
            teardown_timeout: Duration::from_secs(300),
        }
    }
}

/// Drives runs through prerequisites, phases, validation, recovery and
/// teardown
pub struct Orchestrator<'a> {
    remote: &'a dyn RemoteState,
    renderer: &'a dyn ConfigRenderer,
    clock: &'a dyn Clock,
    cancel: CancelToken,
    options: OrchestratorOptions,
    sink: Option<&'a dyn ReportSink>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(remote: &'a dyn RemoteState, renderer: &'a dyn ConfigRenderer) -> Self {
        Self {
            remote,
            renderer,
            clock: &SystemClock,
            cancel: CancelToken::new(),
            options: OrchestratorOptions::default(),
            sink: None,
        }
    }

    /// Builder: replace the time source
    pub fn with_clock(mut self, clock: &'a dyn Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builder: observe a cancellation token
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Builder: emit every finalized report to `sink`
    pub fn with_sink(mut self, sink: &'a dyn ReportSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    fn executor(&self) -> PhaseExecutor<'a> {
        PhaseExecutor::new(
            self.remote,
            self.renderer,
            self.clock,
            self.cancel.clone(),
            self.options.executor.clone(),
        )
    }

    /// Prerequisites, then every phase in order, then validation
    ///
    /// A fatal prerequisite failure aborts before anything is applied. A
    /// recoverable phase failure is handed to recovery unless disabled.
    /// Render failures finish the run and are returned as `Err`.
    pub fn deploy(
        &self,
        run: &mut DeploymentRun,
        checks: &[Box<dyn ValidationCheck + '_>],
        progress: &mut dyn ProgressCallback,
    ) -> Result<DeployOutcome> {
        log::info!(
            "deploying {} to {} (run {})",
            run.plan().name(),
            run.plan().environment().name,
            run.id()
        );

        let owned = run.tracker().keys();
        let gate = prereq::standard_checks(
            self.remote,
            &self.options.prerequisites,
            &owned,
            self.options.executor.request_timeout,
        );
        let prerequisites = run_prerequisites(run.plan().environment(), &gate);
        for warning in prerequisites.warnings() {
            run.warnings
                .push(format!("prerequisite {}: {}", warning.name, warning.message));
        }
        let fatal = prerequisites.fatal_failure().cloned();
        run.prerequisites = prerequisites;

        if let Some(failure) = fatal {
            run.set_cause(FailureCause::Prerequisite {
                check: failure.name,
                message: failure.message,
            });
            return self.finish(run, RunStatus::Aborted);
        }
        run.begin()?;

        let executor = self.executor();
        for index in 0..run.plan().phases().len() {
            let result = match executor.execute_phase(run, index, Entry::Sequential, progress) {
                Ok(result) => result,
                Err(e) => return self.fail_hard(run, index, e),
            };
            let Some(error) = result.error() else {
                continue;
            };

            run.set_cause(FailureCause::Phase {
                phase: run.plan().phases()[index].id.clone(),
                message: error.to_string(),
            });
            let recoverable = error.is_recoverable() && !self.cancel.is_cancelled();
            if !(self.options.auto_recover && recoverable) {
                return self.finish(run, RunStatus::Failed);
            }

            log::warn!("{error}; attempting recovery");
            let recovery = self.reconcile(&executor, run, progress)?;
            if recovery.status != RunStatus::Succeeded {
                return self.finish(run, recovery.status);
            }
            // Recovery drove every remaining phase
            break;
        }

        self.validate_and_finish(run, checks)
    }

    /// Run built-in and caller-supplied checks without changing the
    /// lifecycle state; the report is stored on the run
    pub fn validate(
        &self,
        run: &mut DeploymentRun,
        checks: &[Box<dyn ValidationCheck + '_>],
    ) -> Result<ValidationReport> {
        let report = self.run_validation(run, checks)?;
        run.validation = Some(report.clone());
        Ok(report)
    }

    /// Reconcile a previously finished run, then validate it
    pub fn recover(
        &self,
        run: &mut DeploymentRun,
        checks: &[Box<dyn ValidationCheck + '_>],
        progress: &mut dyn ProgressCallback,
    ) -> Result<DeployOutcome> {
        // Nothing was applied behind a failed gate; only a new deploy can proceed
        if let Some(FailureCause::Prerequisite { check, message }) = run.cause() {
            return Err(Error::PrerequisiteFailure {
                check: check.clone(),
                message: message.clone(),
            });
        }
        run.reopen()?;
        let executor = self.executor();
        let recovery = self.reconcile(&executor, run, progress)?;
        if recovery.status != RunStatus::Succeeded {
            return self.finish(run, recovery.status);
        }
        self.validate_and_finish(run, checks)
    }

    /// Delete every tracked resource and confirm it is gone
    ///
    /// Resources that cannot be deleted or keep showing up remotely stay in
    /// the ledger; [`TeardownReport::into_result`] turns them into a
    /// [`Error::TeardownLeak`].
    pub fn teardown(&self, run: &mut DeploymentRun) -> Result<TeardownReport> {
        let tracked_before = run.tracker().len();
        let timeout = self.options.executor.request_timeout;
        log::info!("tearing down {tracked_before} resource(s) of run {}", run.id());

        let outcome = run
            .tracker_mut()
            .untrack_and_delete(|_| true, self.remote, timeout);

        let keys: Vec<ResourceKey> = outcome.deleted.iter().map(|r| r.key.clone()).collect();
        let gone = self.options.executor.poll_backoff.poll(
            self.clock,
            &self.cancel,
            self.options.teardown_timeout,
            || {
                for key in &keys {
                    if self.remote.get(key, timeout)?.is_some() {
                        return Ok(false);
                    }
                }
                Ok(true)
            },
        );

        let mut report = TeardownReport {
            tracked_before,
            failed: outcome.failed,
            ..TeardownReport::default()
        };
        if matches!(gone, PollOutcome::Satisfied { .. }) {
            report.deleted = keys;
        } else {
            for record in outcome.deleted {
                match self.remote.get(&record.key, timeout) {
                    Ok(None) => report.deleted.push(record.key),
                    Ok(Some(_)) | Err(_) => {
                        log::warn!("{} is still present after deletion", record.key);
                        report.lingering.push(record.key.clone());
                        run.tracker_mut().restore(record, ResourceStatus::Failed);
                    }
                }
            }
        }
        report.remaining = run.tracker().keys().into_iter().collect();

        if report.is_clean() {
            log::info!("teardown removed {} resource(s)", report.deleted.len());
        } else {
            log::error!("teardown left {} resource(s) behind", report.remaining.len());
        }
        Ok(report)
    }

    fn reconcile(
        &self,
        executor: &PhaseExecutor<'_>,
        run: &mut DeploymentRun,
        progress: &mut dyn ProgressCallback,
    ) -> Result<RecoveryResult> {
        let controller = RecoveryController::new(executor, self.options.recovery.clone());
        let recovery = match controller.reconcile(run, progress) {
            Ok(recovery) => recovery,
            Err(e) => {
                let index = run.current_phase().unwrap_or_default();
                return self.fail_hard(run, index, e);
            }
        };

        run.recoveries.push(recovery.clone());
        if recovery.status == RunStatus::Succeeded {
            run.cause = None;
        } else if let Some(failed) = run.failed_phase() {
            let cause = FailureCause::Phase {
                phase: failed.id.clone(),
                message: failed.error.clone().unwrap_or_default(),
            };
            run.set_cause(cause);
        }
        Ok(recovery)
    }

    fn run_validation(
        &self,
        run: &DeploymentRun,
        checks: &[Box<dyn ValidationCheck + '_>],
    ) -> Result<ValidationReport> {
        let standard = validation::standard_checks(self.remote, run);
        let all: Vec<&dyn ValidationCheck> = standard
            .iter()
            .map(|c| &**c)
            .chain(checks.iter().map(|c| &**c))
            .collect();
        validation::run_check_set(run, &all, &self.options.validation)
    }

    fn validate_and_finish(
        &self,
        run: &mut DeploymentRun,
        checks: &[Box<dyn ValidationCheck + '_>],
    ) -> Result<DeployOutcome> {
        let report = self.run_validation(run, checks)?;
        let status = report.status();
        if let Some(Error::ValidationFailure { checks }) = report.to_error() {
            log::error!("run {}: {} critical check(s) failed", run.id(), checks.len());
            run.set_cause(FailureCause::Validation { checks });
        }
        if report.is_degraded() {
            run.warnings.push(format!(
                "deployment is degraded: {} warnings or non-critical failures",
                report.concerns()
            ));
        }
        run.validation = Some(report);
        run.transition(RunState::Validated)?;
        self.finish(run, status)
    }

    /// Finish after an error that must reach the caller
    fn fail_hard<T>(&self, run: &mut DeploymentRun, index: usize, error: Error) -> Result<T> {
        let phase = run
            .plan()
            .phases()
            .get(index)
            .map(|p| p.id.clone())
            .unwrap_or_default();
        run.set_cause(FailureCause::Phase {
            phase,
            message: error.to_string(),
        });
        self.finish(run, RunStatus::Failed)?;
        Err(error)
    }

    fn finish(&self, run: &mut DeploymentRun, status: RunStatus) -> Result<DeployOutcome> {
        let fresh = !run.is_finalized();
        let report = run.finalize(status)?;
        if fresh
            && let Some(sink) = self.sink
            && let Err(e) = sink.emit(&report)
        {
            log::warn!("could not emit report for run {}: {e}", run.id());
        }
        Ok(DeployOutcome {
            status: run.status().unwrap_or(status),
            cause: run.cause().cloned(),
            report,
        })
    }
}
