use anyhow::Result;
use colored::Colorize;
use rollout::{ConfigRenderer, Readiness};

use crate::Context;
use crate::cli::TargetArgs;
use crate::config::LoadedPlan;
use crate::exit_codes;
use crate::renderer::OverlayRenderer;
use crate::schema::CheckDef;
use crate::ui;

/// Print what a deploy would apply, phase by phase
pub fn run(_ctx: &Context, args: TargetArgs) -> Result<i32> {
    let loaded = LoadedPlan::load(&args.plan)?;
    let plan = loaded.file.plan_for(&args.environment)?;
    let renderer = OverlayRenderer::new(&loaded.file, &loaded.base_dir);
    let env = plan.environment();

    ui::header(&format!("{} / {}", plan.name(), env.name));
    ui::kv("Plan file", &loaded.path.display().to_string());
    ui::kv("Namespace", loaded.file.namespace_for(&env.name));
    if (env.timeout_scale - 1.0).abs() > f64::EPSILON {
        ui::kv("Timeout scale", &format!("×{}", env.timeout_scale));
    }
    if let Some(max) = env.max_resources {
        ui::kv("Resource budget", &max.to_string());
    }

    let mut broken = 0;
    let mut total = 0;
    let count = plan.phases().len();
    for (i, phase) in plan.phases().iter().enumerate() {
        let readiness = match phase.readiness {
            Readiness::AllReady => "all ready",
            Readiness::Exists => "exists",
            Readiness::Skip => "no wait",
        };
        println!();
        ui::step(
            i + 1,
            count,
            &format!(
                "{} {}",
                phase.id.bold(),
                format!(
                    "(timeout {}s, {readiness})",
                    plan.effective_timeout(phase).as_secs()
                )
                .dimmed()
            ),
        );

        match renderer.render(env, phase) {
            Ok(specs) if specs.is_empty() => ui::dim("no resources"),
            Ok(specs) => {
                total += specs.len();
                for spec in specs {
                    let manifest = spec
                        .manifest
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "no manifest".to_string());
                    let allowed = phase.allows_kind(&spec.key.kind);
                    let marker = if allowed { "+".green() } else { "!".red() };
                    println!("  {marker} {} {}", spec.key, manifest.dimmed());
                    if !allowed {
                        broken += 1;
                        ui::dim(&format!(
                            "  {} is not an expected kind for this phase",
                            spec.key.kind
                        ));
                    }
                }
            }
            Err(e) => {
                broken += 1;
                ui::error(&format!("{e:#}"));
            }
        }
    }

    let prerequisites = &loaded.file.prerequisites;
    if !prerequisites.capabilities.is_empty() || !prerequisites.optional_capabilities.is_empty() {
        ui::section("Prerequisites");
        for name in &prerequisites.capabilities {
            println!("  {} {name}", "required".red());
        }
        for name in &prerequisites.optional_capabilities {
            println!("  {} {name}", "optional".yellow());
        }
    }

    if !loaded.file.checks.is_empty() {
        ui::section("Checks");
        for check in &loaded.file.checks {
            let (kind, severity) = match check {
                CheckDef::Http(def) => ("http", def.severity),
                CheckDef::Resource(def) => ("resource", def.severity),
            };
            println!("  {} {} {}", ui::severity(severity), kind.dimmed(), check.label());
        }
    }

    println!();
    if let Some(max) = env.max_resources
        && total > max
    {
        ui::error(&format!("{total} resources exceed the budget of {max}"));
        broken += 1;
    }
    if broken > 0 {
        ui::error(&format!("{broken} problem(s) would fail the deployment"));
        return Ok(exit_codes::PHASE);
    }
    ui::success(&format!("{total} resource(s) across {count} phase(s)"));
    Ok(exit_codes::OK)
}
