mod cli;

use std::process::ExitCode;

use clap::Parser;

use paintcore::logger;
use paintcore::settings::EngineSettings;

fn main() -> ExitCode {
    let settings = EngineSettings::load();
    if settings.log_to_file
        && let Err(e) = logger::init()
    {
        // Not fatal: the tool works without a session log.
        eprintln!("[logger] Failed to open log file {}: {}", logger::default_log_path().display(), e);
    }
    let args = cli::CliArgs::parse();
    cli::run(args)
}
