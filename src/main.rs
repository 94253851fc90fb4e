use anyhow::Context;
use clap::Parser;
use rsperf::cli::Cli;
use rsperf::commands::CommandRegistry;
use rsperf::error::exit_code;
use std::process::ExitCode;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(rsperf_err) = e.downcast_ref::<rsperf::Error>() {
                ExitCode::from(rsperf_err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();

    let registry = CommandRegistry::with_builtin_commands();
    let Some(name) = cli.command.as_deref() else {
        eprint!("{}", registry.help_text());
        eprintln!("\nRun 'rsperf <command> --help' for the options of a command.");
        return Ok(());
    };
    let mut command = registry.create(name).ok_or_else(|| {
        rsperf::Error::InvalidArgument(format!(
            "Unknown command '{}'. Available: {}",
            name,
            registry.names().collect::<Vec<_>>().join(", ")
        ))
    })?;
    log::debug!("running {} with {:?}", command.name(), cli.args);
    command
        .run(&cli.args)
        .with_context(|| format!("{name} failed"))?;
    Ok(())
}
