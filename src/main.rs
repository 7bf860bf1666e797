use clap::Parser;
use tubefetch::cli::{Cli, CliCommand};
use tubefetch::logging;

fn main() {
    if let Err(err) = logging::init_logging() {
        logging::init_logging_stderr();
        tracing::warn!("log file unavailable, logging to stderr: {:#}", err);
    }

    let cli = Cli::parse();
    if let Err(err) = run(cli.command) {
        eprintln!("tubefetch error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(command: CliCommand) -> anyhow::Result<()> {
    #[cfg(feature = "desktop")]
    if matches!(command, CliCommand::Gui) {
        return tubefetch::desktop::run();
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(command.run())
}
