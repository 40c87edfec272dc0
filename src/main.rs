mod checks;
mod cli;
mod commands;
mod config;
mod exit_codes;
mod interrupt;
mod kube;
mod paths;
mod progress;
mod renderer;
mod runner;
mod schema;
mod state;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    let code = match dispatch(&ctx, cli.command) {
        Ok(code) => code,
        Err(e) => {
            ui::error(&format!("{e:#}"));
            exit_codes::for_error(&e)
        }
    };
    if code != exit_codes::OK && interrupt::is_interrupted() {
        ui::warn("Interrupted; the run was saved and can be resumed with `bosun recover`");
    }
    std::process::exit(code);
}

fn dispatch(ctx: &Context, command: Command) -> Result<i32> {
    log::trace!("verbosity {}", ctx.verbose);
    match command {
        Command::Deploy(args) => {
            interrupt::install();
            commands::deploy::run(ctx, args)
        }
        Command::Validate(args) => commands::validate::run(ctx, args),
        Command::Recover(args) => {
            interrupt::install();
            commands::recover::run(ctx, args)
        }
        Command::Teardown(args) => commands::teardown::run(ctx, args),
        Command::Status(args) => commands::status::run(ctx, args),
        Command::Plan(args) => commands::plan::run(ctx, args),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "bosun", &mut io::stdout());
            Ok(exit_codes::OK)
        }
    }
}
