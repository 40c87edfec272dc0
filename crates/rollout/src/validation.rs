//! Validation engine - independent health checks aggregated by severity
//!
//! Checks are read-only and independent, so they run concurrently on a
//! bounded rayon pool. Every check yields exactly one [`CheckResult`]: an
//! error or a panic inside a check becomes a `fail` carrying the error as
//! evidence instead of aborting the pass.
//!
//! Aggregation is by severity alone: any critical `fail` fails the run.
//! The success rate is computed for reporting and never changes the status.

use crate::context::RemoteState;
use crate::error::{Error, Result};
use crate::executor::satisfies;
use crate::plan::Readiness;
use crate::run::DeploymentRun;
use crate::types::{CheckOutcome, PhaseStatus, ResourceKey, RunStatus, Severity};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

/// More non-passing, non-critical outcomes than this marks a report degraded
pub const DEGRADED_THRESHOLD: usize = 5;

/// Documented success-rate target, in percent
pub const TARGET_SUCCESS_RATE: f64 = 95.0;

/// What a check sees while it runs
pub struct CheckContext<'a> {
    pub run: &'a DeploymentRun,
    /// Budget for every remote call the check makes
    pub timeout: Duration,
}

/// Evidence produced by one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub outcome: CheckOutcome,
    pub evidence: String,
    pub remediation: Option<String>,
}

impl Finding {
    pub fn pass(evidence: impl Into<String>) -> Self {
        Self::new(CheckOutcome::Pass, evidence)
    }

    pub fn fail(evidence: impl Into<String>) -> Self {
        Self::new(CheckOutcome::Fail, evidence)
    }

    pub fn warn(evidence: impl Into<String>) -> Self {
        Self::new(CheckOutcome::Warn, evidence)
    }

    fn new(outcome: CheckOutcome, evidence: impl Into<String>) -> Self {
        Self {
            outcome,
            evidence: evidence.into(),
            remediation: None,
        }
    }

    /// Builder: attach a remediation hint
    pub fn with_remediation(mut self, hint: impl Into<String>) -> Self {
        self.remediation = Some(hint.into());
        self
    }
}

/// One health check
pub trait ValidationCheck: Send + Sync {
    fn name(&self) -> String;

    /// Grouping used in reports
    fn category(&self) -> String {
        "General".to_string()
    }

    fn severity(&self) -> Severity;

    /// Per-check budget; a check that overruns it fails
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn run(&self, ctx: &CheckContext<'_>) -> anyhow::Result<Finding>;
}

/// Recorded outcome of one check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub category: String,
    pub severity: Severity,
    pub outcome: CheckOutcome,
    pub evidence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    pub duration_ms: u64,
    pub checked_at: DateTime<Utc>,
}

/// Pass / fail / warn tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub pass: usize,
    pub fail: usize,
    pub warn: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: CheckOutcome) {
        match outcome {
            CheckOutcome::Pass => self.pass += 1,
            CheckOutcome::Fail => self.fail += 1,
            CheckOutcome::Warn => self.warn += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pass + self.fail + self.warn
    }
}

/// Aggregated result of a validation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub pass: usize,
    pub fail: usize,
    pub warn: usize,
    pub by_severity: BTreeMap<Severity, OutcomeCounts>,
    pub by_category: BTreeMap<String, OutcomeCounts>,
    pub results: Vec<CheckResult>,
}

impl ValidationReport {
    /// Aggregate individual results
    pub fn from_results(results: Vec<CheckResult>) -> Self {
        let mut report = Self::default();
        for result in &results {
            match result.outcome {
                CheckOutcome::Pass => report.pass += 1,
                CheckOutcome::Fail => report.fail += 1,
                CheckOutcome::Warn => report.warn += 1,
            }
            report
                .by_severity
                .entry(result.severity)
                .or_default()
                .record(result.outcome);
            report
                .by_category
                .entry(result.category.clone())
                .or_default()
                .record(result.outcome);
        }
        report.results = results;
        report
    }

    pub fn total(&self) -> usize {
        self.pass + self.fail + self.warn
    }

    /// Failed if any critical check failed, otherwise succeeded
    pub fn status(&self) -> RunStatus {
        if self.critical_failures().next().is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    /// Critical checks that failed
    pub fn critical_failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results
            .iter()
            .filter(|r| r.severity == Severity::Critical && r.outcome == CheckOutcome::Fail)
    }

    /// Warnings plus non-critical failures
    pub fn concerns(&self) -> usize {
        self.results
            .iter()
            .filter(|r| match r.outcome {
                CheckOutcome::Warn => true,
                CheckOutcome::Fail => r.severity != Severity::Critical,
                CheckOutcome::Pass => false,
            })
            .count()
    }

    /// Healthy but with more concerns than [`DEGRADED_THRESHOLD`]
    pub fn is_degraded(&self) -> bool {
        self.concerns() > DEGRADED_THRESHOLD
    }

    /// Passing checks in percent; an empty pass counts as 100
    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            return 100.0;
        }
        self.pass as f64 * 100.0 / self.total() as f64
    }

    /// Whether the success rate reaches `minimum` percent
    pub fn meets(&self, minimum: f64) -> bool {
        self.success_rate() >= minimum
    }

    /// Error naming the critical failures, if any
    pub fn to_error(&self) -> Option<Error> {
        let checks: Vec<String> = self.critical_failures().map(|r| r.name.clone()).collect();
        if checks.is_empty() {
            None
        } else {
            Some(Error::ValidationFailure { checks })
        }
    }
}

/// Options for a validation pass
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// Worker pool size
    pub jobs: usize,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self { jobs: 4 }
    }
}

/// Run every check against `run` and aggregate the outcomes
///
/// Results come back in the order of `checks`, whatever order the pool
/// finished them in.
pub fn run_checks(
    run: &DeploymentRun,
    checks: &[Box<dyn ValidationCheck + '_>],
    options: &ValidationOptions,
) -> Result<ValidationReport> {
    let checks: Vec<&dyn ValidationCheck> = checks.iter().map(|c| &**c).collect();
    run_check_set(run, &checks, options)
}

/// Same as [`run_checks`] over borrowed checks
pub fn run_check_set(
    run: &DeploymentRun,
    checks: &[&dyn ValidationCheck],
    options: &ValidationOptions,
) -> Result<ValidationReport> {
    if checks.is_empty() {
        return Ok(ValidationReport::default());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs.max(1))
        .thread_name(|i| format!("validate-{i}"))
        .build()
        .map_err(|e| Error::WorkerPool(e.to_string()))?;

    let results: Vec<CheckResult> = pool.install(|| {
        checks
            .par_iter()
            .map(|check| run_one(*check, run))
            .collect()
    });

    let report = ValidationReport::from_results(results);
    log::info!(
        "validation: {} passed, {} failed, {} warnings",
        report.pass,
        report.fail,
        report.warn
    );
    Ok(report)
}

fn run_one(check: &dyn ValidationCheck, run: &DeploymentRun) -> CheckResult {
    let name = check.name();
    let timeout = check.timeout();
    let ctx = CheckContext { run, timeout };
    let checked_at = Utc::now();
    let start = Instant::now();

    let finding = match panic::catch_unwind(AssertUnwindSafe(|| check.run(&ctx))) {
        Ok(Ok(finding)) => finding,
        Ok(Err(e)) => Finding::fail(format!("{e:#}")),
        Err(payload) => Finding::fail(format!("check panicked: {}", panic_message(&*payload))),
    };
    let elapsed = start.elapsed();

    let finding = if elapsed > timeout && finding.outcome != CheckOutcome::Fail {
        Finding::fail(format!(
            "check took {}ms, over its {}s budget",
            elapsed.as_millis(),
            timeout.as_secs()
        ))
    } else {
        finding
    };

    log::debug!("check {name}: {} ({})", finding.outcome, finding.evidence);
    CheckResult {
        name,
        category: check.category(),
        severity: check.severity(),
        outcome: finding.outcome,
        evidence: finding.evidence,
        remediation: finding.remediation,
        duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        checked_at,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// What a [`ResourceCheck`] expects to observe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Ready,
    Exists,
}

/// A remote resource is ready, or at least present
pub struct ResourceCheck<'a> {
    remote: &'a dyn RemoteState,
    key: ResourceKey,
    severity: Severity,
    expect: Expect,
}

impl<'a> ResourceCheck<'a> {
    pub fn ready(remote: &'a dyn RemoteState, key: ResourceKey, severity: Severity) -> Self {
        Self {
            remote,
            key,
            severity,
            expect: Expect::Ready,
        }
    }

    pub fn exists(remote: &'a dyn RemoteState, key: ResourceKey, severity: Severity) -> Self {
        Self {
            remote,
            key,
            severity,
            expect: Expect::Exists,
        }
    }
}

impl ValidationCheck for ResourceCheck<'_> {
    fn name(&self) -> String {
        match self.expect {
            Expect::Ready => format!("resource-ready:{}", self.key),
            Expect::Exists => format!("resource-exists:{}", self.key),
        }
    }

    fn category(&self) -> String {
        self.key.kind.clone()
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    fn run(&self, ctx: &CheckContext<'_>) -> anyhow::Result<Finding> {
        let readiness = match self.expect {
            Expect::Ready => Readiness::AllReady,
            Expect::Exists => Readiness::Exists,
        };
        let observed = self.remote.get(&self.key, ctx.timeout)?;
        let finding = match observed {
            None => Finding::fail(format!("{} not found", self.key)).with_remediation(format!(
                "run recovery to recreate {}",
                self.key
            )),
            Some(status) if satisfies(readiness, Some(status)) => {
                Finding::pass(format!("{} is {status}", self.key))
            }
            Some(status) => Finding::fail(format!("{} is {status}", self.key))
                .with_remediation(format!("inspect {} and its events", self.key)),
        };
        Ok(finding)
    }
}

/// A phase of the run reached `Completed`
struct PhaseComplete {
    phase: String,
}

impl ValidationCheck for PhaseComplete {
    fn name(&self) -> String {
        format!("phase-complete:{}", self.phase)
    }

    fn category(&self) -> String {
        "Phases".to_string()
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn run(&self, ctx: &CheckContext<'_>) -> anyhow::Result<Finding> {
        let record = ctx
            .run
            .phase_record(&self.phase)
            .ok_or_else(|| anyhow::anyhow!("phase '{}' is not part of the run", self.phase))?;
        Ok(match record.status {
            PhaseStatus::Completed => Finding::pass(format!("phase '{}' completed", self.phase)),
            status => Finding::fail(format!("phase '{}' is {status}", self.phase))
                .with_remediation("run recovery for this environment"),
        })
    }
}

/// Built-in checks: every phase completed and every tracked resource healthy
///
/// Resources of `AllReady` phases must be ready; the rest must exist.
pub fn standard_checks<'a>(
    remote: &'a dyn RemoteState,
    run: &DeploymentRun,
) -> Vec<Box<dyn ValidationCheck + 'a>> {
    let mut checks: Vec<Box<dyn ValidationCheck + 'a>> = Vec::new();

    for phase in run.plan().phases() {
        checks.push(Box::new(PhaseComplete {
            phase: phase.id.clone(),
        }));
    }

    for record in run.tracker().snapshot() {
        let readiness = run
            .plan()
            .phase(&record.phase)
            .map_or(Readiness::AllReady, |p| p.readiness);
        let check = if readiness == Readiness::AllReady {
            ResourceCheck::ready(remote, record.key, Severity::Critical)
        } else {
            ResourceCheck::exists(remote, record.key, Severity::Critical)
        };
        checks.push(Box::new(check));
    }

    checks
}
