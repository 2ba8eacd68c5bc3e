//! pulse — filesystem maintenance tool.
//!
//! With no arguments, starts the interactive shell; with arguments, runs
//! one command non-interactively (`pulse create image.hdd 50G`).

use std::process::ExitCode;

use clap::Parser;

use pulse::cli;

/// pulse filesystem maintenance tool.
#[derive(Parser)]
#[command(name = "pulse", version, about)]
struct Cli {
    /// Command and its arguments; omit for the interactive shell.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    cli::install_sigint();

    let status = if args.command.is_empty() {
        cli::repl()
    } else {
        cli::run_script(&args.command)
    };

    if status == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
