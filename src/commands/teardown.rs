use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use dialoguer::Confirm;
use std::io::IsTerminal;

use crate::Context;
use crate::cli::TeardownArgs;
use crate::commands::Session;
use crate::exit_codes;
use crate::ui;

pub fn run(ctx: &Context, args: TeardownArgs) -> Result<i32> {
    let session = Session::open(&args.target)?;
    let mut run = session.store.require(&session.environment)?;

    if run.tracker().is_empty() {
        ui::info(&format!(
            "Nothing to tear down: no resources tracked for {}",
            session.environment
        ));
        return Ok(exit_codes::OK);
    }
    session.ensure_kubectl()?;

    if !ctx.quiet {
        ui::header(&format!("Tearing down {}", session.environment.bold()));
        for record in run.tracker().snapshot().iter().rev() {
            println!(
                "  {} {} {}",
                "-".red(),
                record.key,
                format!("(phase {})", record.phase).dimmed()
            );
        }
        println!();
    }

    if !args.yes {
        if !std::io::stdin().is_terminal() {
            bail!("Refusing to delete resources without confirmation; pass --yes");
        }
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete {} resource(s) from {}?",
                run.tracker().len(),
                session.environment
            ))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            ui::info("Teardown cancelled");
            return Ok(exit_codes::OK);
        }
    }

    let renderer = session.renderer();
    let sink = session.sink();
    let orchestrator = session.orchestrator(&renderer, &sink, session.options(1));

    let result = orchestrator.teardown(&mut run);
    session.store.save(&run)?;
    let report = result?;

    for (key, message) in &report.failed {
        ui::error(&format!("{key}: {message}"));
    }
    for key in &report.lingering {
        ui::warn(&format!("{key} is still present after deletion"));
    }

    let deleted = report.deleted.len();
    match report.into_result() {
        Ok(_) => {
            ui::success(&format!("Removed {deleted} resource(s); nothing left behind"));
            Ok(exit_codes::OK)
        }
        Err(e) => {
            ui::error(&e.to_string());
            ui::dim("Re-run teardown once the remaining resources can be deleted");
            Ok(exit_codes::TEARDOWN_LEAK)
        }
    }
}
