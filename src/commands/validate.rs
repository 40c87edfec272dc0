use anyhow::Result;
use rollout::RunStatus;
use rollout::validation::TARGET_SUCCESS_RATE;

use crate::Context;
use crate::cli::ValidateArgs;
use crate::commands::{self, Session};
use crate::exit_codes;
use crate::ui;

pub fn run(ctx: &Context, args: ValidateArgs) -> Result<i32> {
    let session = Session::open(&args.target)?;
    session.ensure_kubectl()?;
    let mut run = session.store.require(&session.environment)?;

    let renderer = session.renderer();
    let sink = session.sink();
    let orchestrator = session.orchestrator(&renderer, &sink, session.options(args.jobs));
    let checks = session.checks()?;

    let report = orchestrator.validate(&mut run, &checks)?;
    session.store.save(&run)?;

    if !ctx.quiet {
        ui::header(&format!("Validating {}", session.environment));
        commands::print_validation(&report);
    }

    if report.status() == RunStatus::Failed {
        let names: Vec<_> = report.critical_failures().map(|r| r.name.as_str()).collect();
        ui::error(&format!("Critical checks failed: {}", names.join(", ")));
        return Ok(exit_codes::VALIDATION);
    }

    let rate = report.success_rate();
    if let Some(minimum) = args.min_success_rate {
        if !report.meets(minimum) {
            ui::error(&format!("Success rate {rate:.1}% is below the required {minimum:.1}%"));
            return Ok(exit_codes::VALIDATION);
        }
    } else if rate < TARGET_SUCCESS_RATE && !ctx.quiet {
        ui::warn(&format!(
            "Success rate {rate:.1}% is below the {TARGET_SUCCESS_RATE:.0}% target"
        ));
    }

    if !ctx.quiet {
        ui::success("Validation passed");
    }
    Ok(exit_codes::OK)
}
