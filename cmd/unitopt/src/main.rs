use clap::Parser;
use tracing::Level;
use tracing_subscriber::{EnvFilter, filter::Directive};

mod cli;

use cli::Cli;

fn init_tracing(level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(Directive::from(level))
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(matches!(level, Level::DEBUG | Level::TRACE))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.options.log_level);
    cli.command.run(&cli.options)
}
