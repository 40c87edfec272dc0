use anyhow::Result;
use colored::Colorize;

use crate::Context;
use crate::cli::TargetArgs;
use crate::commands::{self, Session};
use crate::exit_codes;
use crate::progress::TerminalProgress;
use crate::ui;

pub fn run(ctx: &Context, args: TargetArgs) -> Result<i32> {
    let session = Session::open(&args)?;
    session.ensure_kubectl()?;
    let mut run = session.store.require(&session.environment)?;

    let renderer = session.renderer();
    let sink = session.sink();
    let orchestrator = session.orchestrator(&renderer, &sink, session.options(4));
    let checks = session.checks()?;

    if !ctx.quiet {
        let previous = run
            .status()
            .map_or_else(|| run.state().to_string(), |s| s.to_string());
        ui::header(&format!("Recovering {}", session.environment.bold()));
        ui::dim(&format!("run {} · last status {previous}", run.id()));
        println!();
    }

    let mut progress = TerminalProgress::new(ctx.quiet);
    let result = orchestrator.recover(&mut run, &checks, &mut progress);
    session.store.save(&run)?;
    let outcome = result?;

    if !ctx.quiet {
        if let Some(recovery) = run.recoveries.last()
            && recovery.was_noop()
        {
            ui::info("Already converged: no phase needed to be re-run");
        }
        if let Some(validation) = &run.validation {
            commands::print_validation(validation);
        }
        commands::print_outcome(&outcome, &sink);
    }

    Ok(exit_codes::for_outcome(outcome.status, outcome.cause.as_ref()))
}
