use anyhow::Result;
use colored::Colorize;
use rollout::DeploymentRun;

use crate::Context;
use crate::cli::TargetArgs;
use crate::exit_codes;
use crate::state::RunStore;
use crate::ui;

pub fn run(_ctx: &Context, args: TargetArgs) -> Result<i32> {
    let store = RunStore::open()?;
    let Some(run) = store.load(&args.environment)? else {
        ui::info(&format!("No deployment recorded for '{}'", args.environment));
        ui::dim(&format!("State directory: {}", store.root().display()));
        return Ok(exit_codes::OK);
    };

    ui::header(&format!("{} / {}", run.plan().name(), args.environment));
    show_run(&run);
    show_phases(&run);
    show_ledger(&run);
    show_checks(&run);

    if !run.warnings.is_empty() {
        ui::section("Warnings");
        for warning in &run.warnings {
            ui::warn(warning);
        }
    }
    println!();
    Ok(exit_codes::OK)
}

fn show_run(run: &DeploymentRun) {
    ui::kv("Run", run.id());
    ui::kv("State", &run.state().to_string());
    ui::kv(
        "Status",
        &run.status()
            .map_or_else(|| "in progress".dimmed().to_string(), ui::run_status),
    );
    ui::kv(
        "Started",
        &run.started_at().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    );
    if let Some(finished) = run.finished_at() {
        let ms = (finished - run.started_at()).num_milliseconds();
        ui::kv(
            "Finished",
            &format!(
                "{} ({})",
                finished.format("%Y-%m-%d %H:%M:%S UTC"),
                ui::format_duration_ms(ms)
            ),
        );
    }
    if let Some(cause) = run.cause() {
        ui::kv("Cause", &cause.to_string().red().to_string());
    }
    if !run.recoveries.is_empty() {
        ui::kv("Recoveries", &run.recoveries.len().to_string());
    }
}

fn show_phases(run: &DeploymentRun) {
    ui::section("Phases");
    for (i, record) in run.phases().iter().enumerate() {
        let duration = record
            .duration_ms
            .map(ui::format_duration_ms)
            .unwrap_or_default();
        let tracked = run.tracker().records_for_phase(&record.id).len();
        println!(
            "  {} {:>2}. {:<20} {} {} {}",
            ui::phase_glyph(record.status),
            i + 1,
            record.id,
            record.status.to_string().dimmed(),
            format!("{tracked} tracked").dimmed(),
            duration.dimmed()
        );
        if record.executions > 1 {
            ui::dim(&format!("     executed {} times", record.executions));
        }
        if let Some(error) = &record.error {
            println!("       {}", error.red());
        }
    }
}

fn show_ledger(run: &DeploymentRun) {
    let records = run.tracker().snapshot();
    ui::section(&format!("Resources ({})", records.len()));
    if records.is_empty() {
        ui::dim("none tracked");
        return;
    }
    for record in records {
        println!(
            "  {:<50} {:<10} {}",
            record.key.to_string(),
            ui::resource_status(record.status),
            format!("phase {} · gen {}", record.phase, record.generation).dimmed()
        );
    }
}

fn show_checks(run: &DeploymentRun) {
    let Some(validation) = &run.validation else {
        return;
    };
    ui::section("Last Validation");
    ui::kv(
        "Checks",
        &format!(
            "{} pass, {} warn, {} fail ({:.1}%)",
            validation.pass,
            validation.warn,
            validation.fail,
            validation.success_rate()
        ),
    );
    for result in validation.critical_failures() {
        println!("  {} {}: {}", "✗".red(), result.name, result.evidence);
    }
}
