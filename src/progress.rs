//! Terminal progress for phase execution.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rollout::{ApplyOutcome, Phase, PhaseResult, ProgressCallback, ResourceKey};
use std::time::Duration;

use crate::ui;

/// Spinner per phase, one summary line when the phase ends
pub struct TerminalProgress {
    bar: Option<ProgressBar>,
    quiet: bool,
    interactive: bool,
}

impl TerminalProgress {
    pub fn new(quiet: bool) -> Self {
        Self {
            bar: None,
            quiet,
            interactive: console::Term::stderr().is_term(),
        }
    }

    fn spinner(&self, msg: String) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        if self.quiet || !self.interactive {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg} {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(msg);
        pb
    }
}

impl ProgressCallback for TerminalProgress {
    fn on_phase_start(&mut self, phase: &Phase, resources: usize) {
        log::info!("phase {} started with {resources} resource(s)", phase.id);
        self.bar = Some(self.spinner(format!(
            "{} applying {resources} resource(s)",
            phase.id.bold()
        )));
    }

    fn on_resource_applied(&mut self, key: &ResourceKey, outcome: ApplyOutcome) {
        log::debug!("{key}: {outcome:?}");
        if let Some(bar) = &self.bar {
            bar.set_message(format!("applied {key} ({outcome:?})"));
        }
    }

    fn on_readiness_poll(&mut self, phase: &Phase, ready: usize, total: usize) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("{} waiting for readiness {ready}/{total}", phase.id.bold()));
        }
    }

    fn on_phase_complete(&mut self, phase: &Phase, result: &PhaseResult) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        let summary = result.summary();
        let counts = format!(
            "{} created, {} updated, {} unchanged",
            summary.created, summary.updated, summary.unchanged
        );
        if self.quiet {
            return;
        }
        match result.error() {
            None => ui::success(&format!("{} {}", phase.id, counts.dimmed())),
            Some(e) => ui::error(&format!("{}: {e}", phase.id)),
        }
        for warning in result.warnings() {
            ui::warn(warning);
        }
    }
}
