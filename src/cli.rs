use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::config::DEFAULT_PLAN_FILE;

#[derive(Parser)]
#[command(name = "bosun")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Phased cluster deployments with validation, recovery and leak-free teardown", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check prerequisites, roll out every phase, then validate
    Deploy(DeployArgs),

    /// Run validation checks against the last deployment
    Validate(ValidateArgs),

    /// Re-drive the earliest unsatisfied phase and everything after it
    Recover(TargetArgs),

    /// Delete every tracked resource and verify nothing is left behind
    Teardown(TeardownArgs),

    /// Show the last run, its phases and the resource ledger
    Status(TargetArgs),

    /// Render the desired resources per phase without touching the cluster
    Plan(TargetArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Shared Arguments
// ============================================================================

#[derive(Args, Clone)]
pub struct TargetArgs {
    /// Target environment (must be declared in the plan file)
    #[arg(short, long, env = "BOSUN_ENVIRONMENT")]
    pub environment: String,

    /// Plan file (.toml or .json)
    #[arg(short, long, env = "BOSUN_PLAN", default_value = DEFAULT_PLAN_FILE)]
    pub plan: PathBuf,
}

// ============================================================================
// Deploy / Validate / Teardown
// ============================================================================

#[derive(Args)]
pub struct DeployArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Number of validation checks to run in parallel
    #[arg(short, long, default_value = "4")]
    pub jobs: usize,

    /// Stop at the first failed phase instead of reconciling
    #[arg(long)]
    pub no_recover: bool,

    /// Also write the run report to this path
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Args)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Number of validation checks to run in parallel
    #[arg(short, long, default_value = "4")]
    pub jobs: usize,

    /// Fail unless at least this percentage of checks pass
    #[arg(long, value_parser = parse_percentage)]
    pub min_success_rate: Option<f64>,
}

#[derive(Args)]
pub struct TeardownArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

fn parse_percentage(value: &str) -> Result<f64, String> {
    let rate: f64 = value
        .trim_end_matches('%')
        .parse()
        .map_err(|_| format!("'{value}' is not a number"))?;
    if (0.0..=100.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{rate} is not between 0 and 100"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_deploy() {
        let cli = Cli::parse_from([
            "bosun",
            "-vv",
            "deploy",
            "-e",
            "staging",
            "--plan",
            "deploy/bosun.toml",
            "--jobs",
            "8",
            "--no-recover",
        ]);
        assert_eq!(cli.verbose, 2);
        let Command::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert_eq!(args.target.environment, "staging");
        assert_eq!(args.target.plan, PathBuf::from("deploy/bosun.toml"));
        assert_eq!(args.jobs, 8);
        assert!(args.no_recover);
        assert!(args.report.is_none());
    }

    #[test]
    fn test_parse_min_success_rate() {
        assert_eq!(parse_percentage("95"), Ok(95.0));
        assert_eq!(parse_percentage("99.5%"), Ok(99.5));
        assert!(parse_percentage("120").is_err());
        assert!(parse_percentage("most").is_err());
    }
}
