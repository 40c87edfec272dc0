//! Command implementations; each returns the process exit code.

pub mod deploy;
pub mod plan;
pub mod recover;
pub mod status;
pub mod teardown;
pub mod validate;

use anyhow::{Result, bail};
use colored::Colorize;
use rollout::{
    CancelToken, DeployOutcome, DeploymentPlan, ExecutorOptions, JsonFileSink, Orchestrator,
    OrchestratorOptions, ValidationCheck, ValidationOptions, ValidationReport,
};
use std::time::Duration;

use crate::checks;
use crate::cli::TargetArgs;
use crate::config::LoadedPlan;
use crate::interrupt;
use crate::kube::KubectlClient;
use crate::renderer::OverlayRenderer;
use crate::runner;
use crate::state::RunStore;
use crate::ui;

/// Everything a command needs for one environment
pub struct Session {
    pub loaded: LoadedPlan,
    pub environment: String,
    pub store: RunStore,
    pub client: KubectlClient,
}

impl Session {
    pub fn open(target: &TargetArgs) -> Result<Self> {
        let loaded = LoadedPlan::load(&target.plan)?;
        // Reject unknown environments before touching anything
        loaded.file.plan_for(&target.environment)?;
        let client = KubectlClient::from_config(&loaded.file.remote);

        Ok(Self {
            loaded,
            environment: target.environment.clone(),
            store: RunStore::open()?,
            client,
        })
    }

    pub fn plan(&self) -> Result<DeploymentPlan> {
        self.loaded.file.plan_for(&self.environment)
    }

    pub fn renderer(&self) -> OverlayRenderer<'_> {
        OverlayRenderer::new(&self.loaded.file, &self.loaded.base_dir)
    }

    pub fn checks(&self) -> Result<Vec<Box<dyn ValidationCheck + '_>>> {
        checks::declared_checks(&self.loaded.file, &self.environment, &self.client)
    }

    pub fn sink(&self) -> JsonFileSink {
        JsonFileSink::new(self.store.reports_dir(&self.environment))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.loaded.file.remote.request_timeout_secs)
    }

    pub fn options(&self, jobs: usize) -> OrchestratorOptions {
        OrchestratorOptions {
            executor: ExecutorOptions {
                request_timeout: self.request_timeout(),
                ..ExecutorOptions::default()
            },
            validation: ValidationOptions { jobs: jobs.max(1) },
            ..OrchestratorOptions::default()
        }
    }

    pub fn orchestrator<'s>(
        &'s self,
        renderer: &'s OverlayRenderer<'s>,
        sink: &'s JsonFileSink,
        options: OrchestratorOptions,
    ) -> Orchestrator<'s> {
        Orchestrator::new(&self.client, renderer)
            .with_cancel(CancelToken::with_signal(interrupt::flag()))
            .with_options(options)
            .with_sink(sink)
    }

    pub fn ensure_kubectl(&self) -> Result<()> {
        let binary = self.client.binary();
        if !runner::command_exists(binary) {
            bail!("{binary} not found in PATH (set [remote].kubectl in the plan file)");
        }
        Ok(())
    }
}

// ============================================================================
// Shared Output
// ============================================================================

/// Summary printed after deploy and recover
pub fn print_outcome(outcome: &DeployOutcome, sink: &JsonFileSink) {
    let report = &outcome.report;

    ui::section("Run");
    ui::kv("Run", &report.run_id);
    ui::kv("Status", &ui::run_status(outcome.status));
    if let Some(ms) = report.duration_ms {
        ui::kv("Duration", &ui::format_duration_ms(ms));
    }
    ui::kv("Resources", &report.resources.len().to_string());
    for recovery in &report.recoveries {
        ui::kv(
            "Recovery",
            &format!(
                "{} from {} ({} recreated, {} attempt(s))",
                ui::run_status(recovery.status),
                recovery.resumed_from_phase.as_deref().unwrap_or("-"),
                recovery.resources_recreated,
                recovery.attempts
            ),
        );
    }
    if let Some(validation) = &report.validation {
        ui::kv(
            "Checks",
            &format!(
                "{} pass, {} warn, {} fail ({:.1}%)",
                validation.pass, validation.warn, validation.fail, validation.success_rate
            ),
        );
    }
    ui::kv("Report", &sink.path_for(report).display().to_string());

    if !report.warnings.is_empty() {
        ui::section("Warnings");
        for warning in &report.warnings {
            ui::warn(warning);
        }
    }

    println!();
    match &outcome.cause {
        None if outcome.is_success() => ui::success("Deployment succeeded"),
        None => ui::error(&format!("Deployment {}", outcome.status)),
        Some(cause) => ui::error(&cause.to_string()),
    }
}

/// Per-check lines plus totals
pub fn print_validation(report: &ValidationReport) {
    ui::section("Validation");
    for result in &report.results {
        println!(
            "  {} {} {} {}",
            ui::check_glyph(result.outcome),
            result.name,
            ui::severity(result.severity),
            format!("{} ({}ms)", result.evidence, result.duration_ms).dimmed()
        );
        if result.outcome != rollout::CheckOutcome::Pass
            && let Some(hint) = &result.remediation
        {
            println!("      {} {}", "Fix:".cyan(), hint);
        }
    }

    if !report.by_category.is_empty() {
        ui::section("By Category");
        for (category, counts) in &report.by_category {
            ui::kv(
                category,
                &format!("{} pass, {} warn, {} fail", counts.pass, counts.warn, counts.fail),
            );
        }
    }

    println!();
    ui::kv(
        "Total",
        &format!(
            "{} pass, {} warn, {} fail ({:.1}% success)",
            report.pass,
            report.warn,
            report.fail,
            report.success_rate()
        ),
    );
    if report.is_degraded() {
        ui::warn(&format!(
            "Degraded: {} warnings or non-critical failures",
            report.concerns()
        ));
    }
}
