use anyhow::{Context as _, Result};
use colored::Colorize;
use rollout::DeploymentRun;

use crate::Context;
use crate::cli::DeployArgs;
use crate::commands::{self, Session};
use crate::exit_codes;
use crate::progress::TerminalProgress;
use crate::renderer::OverlayRenderer;
use crate::ui;

pub fn run(ctx: &Context, args: DeployArgs) -> Result<i32> {
    let session = Session::open(&args.target)?;
    session.ensure_kubectl()?;

    let plan = session.plan()?;
    let namespaces = OverlayRenderer::new(&session.loaded.file, &session.loaded.base_dir)
        .without_manifest_checks()
        .namespaces(&plan)?;

    let mut run = DeploymentRun::new(plan);
    if let Some(previous) = session.store.load(&session.environment)? {
        log::info!(
            "adopting {} tracked resource(s) from run {}",
            previous.tracker().len(),
            previous.id()
        );
        run = run.with_tracker(previous.tracker().clone());
    }

    let mut options = session.options(args.jobs);
    options.prerequisites = session.loaded.file.prerequisite_settings(namespaces);
    options.auto_recover = !args.no_recover;

    let renderer = session.renderer();
    let sink = session.sink();
    let orchestrator = session.orchestrator(&renderer, &sink, options);
    let checks = session.checks()?;

    if !ctx.quiet {
        ui::header(&format!(
            "Deploying {} to {}",
            run.plan().name(),
            session.environment.bold()
        ));
        ui::dim(&format!(
            "run {} · {} phase(s) · {} tracked resource(s)",
            run.id(),
            run.plan().phases().len(),
            run.tracker().len()
        ));
        println!();
    }

    let mut progress = TerminalProgress::new(ctx.quiet);
    let result = orchestrator.deploy(&mut run, &checks, &mut progress);
    // The run is persisted whatever happened, so recover/teardown can pick it up
    session.store.save(&run)?;
    let outcome = result?;

    if let Some(path) = &args.report {
        outcome
            .report
            .write(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    if !ctx.quiet {
        if !run.prerequisites.failed.is_empty() {
            ui::section("Prerequisites");
            for failed in &run.prerequisites.failed {
                let label = if failed.fatal { "✗".red() } else { "⚠".yellow() };
                println!("  {label} {}: {}", failed.name, failed.message);
            }
        }
        if let Some(validation) = &run.validation {
            commands::print_validation(validation);
        }
        commands::print_outcome(&outcome, &sink);
    }

    Ok(exit_codes::for_outcome(outcome.status, outcome.cause.as_ref()))
}
