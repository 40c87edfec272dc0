//! Run reports for downstream consumers

use crate::error::Result;
use crate::prereq::PrerequisiteReport;
use crate::recovery::RecoveryResult;
use crate::resource::ResourceRecord;
use crate::run::{DeploymentRun, FailureCause, PhaseRecord};
use crate::types::{RunStatus, Severity};
use crate::validation::{CheckResult, OutcomeCounts, ValidationReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Validation section of a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub pass: usize,
    pub fail: usize,
    pub warn: usize,
    pub by_severity: BTreeMap<Severity, OutcomeCounts>,
    pub by_category: BTreeMap<String, OutcomeCounts>,
    pub success_rate: f64,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub critical_failures: Vec<String>,
    pub results: Vec<CheckResult>,
}

impl From<&ValidationReport> for ValidationSummary {
    fn from(report: &ValidationReport) -> Self {
        Self {
            pass: report.pass,
            fail: report.fail,
            warn: report.warn,
            by_severity: report.by_severity.clone(),
            by_category: report.by_category.clone(),
            success_rate: report.success_rate(),
            degraded: report.is_degraded(),
            critical_failures: report.critical_failures().map(|r| r.name.clone()).collect(),
            results: report.results.clone(),
        }
    }
}

/// Structured summary of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: String,
    pub plan: String,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    pub phases: Vec<PhaseRecord>,
    pub prerequisites: PrerequisiteReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recoveries: Vec<RecoveryResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Ledger at the time the report was produced
    pub resources: Vec<ResourceRecord>,
}

impl Report {
    pub fn from_run(run: &DeploymentRun) -> Self {
        Self {
            run_id: run.id().to_string(),
            plan: run.plan().name().to_string(),
            environment: run.plan().environment().name.clone(),
            started_at: run.started_at(),
            finished_at: run.finished_at(),
            duration_ms: run
                .finished_at()
                .map(|end| (end - run.started_at()).num_milliseconds()),
            status: run.status(),
            cause: run.cause().cloned(),
            phases: run.phases().to_vec(),
            prerequisites: run.prerequisites.clone(),
            validation: run.validation.as_ref().map(ValidationSummary::from),
            recoveries: run.recoveries.clone(),
            warnings: run.warnings.clone(),
            resources: run.tracker().snapshot(),
        }
    }

    /// Write the report as pretty JSON, creating parent directories
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        log::debug!("wrote report {} to {}", self.run_id, path.display());
        Ok(())
    }
}

/// Destination for finalized reports
pub trait ReportSink: Send + Sync {
    fn emit(&self, report: &Report) -> Result<()>;
}

/// Writes `<dir>/<run-id>.json`
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, report: &Report) -> PathBuf {
        self.dir.join(format!("{}.json", report.run_id))
    }
}

impl ReportSink for JsonFileSink {
    fn emit(&self, report: &Report) -> Result<()> {
        report.write(&self.path_for(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{DeploymentPlan, Environment, Phase};

    fn finished_run() -> DeploymentRun {
        let plan = DeploymentPlan::new(
            "platform",
            Environment::new("staging"),
            vec![Phase::new("apps", 1, 60)],
        )
        .unwrap();
        let mut run = DeploymentRun::new(plan);
        run.transition(crate::run::RunState::Finished {
            status: RunStatus::Aborted,
        })
        .unwrap();
        run
    }

    #[test]
    fn test_json_file_sink_writes_run_report() {
        let temp = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(temp.path().join("reports"));
        let report = Report::from_run(&finished_run());

        sink.emit(&report).unwrap();

        let path = sink.path_for(&report);
        assert!(path.exists());
        let loaded: Report = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.run_id, report.run_id);
        assert_eq!(loaded.environment, "staging");
        assert_eq!(loaded.phases.len(), 1);
    }

    #[test]
    fn test_run_id_names_environment() {
        let report = Report::from_run(&finished_run());
        assert!(report.run_id.starts_with("staging-"));
        assert!(report.validation.is_none());
    }
}
