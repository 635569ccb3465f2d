mod cli;
mod commands;
mod formatter;

use clap::Parser;
use cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output only.
    let filter = if cli.global.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let global = &cli.global;
    match cli.command {
        cli::Commands::Create(args) => commands::create::execute(args, global).await?,
        cli::Commands::Start(args) => commands::lifecycle::start(args, global).await?,
        cli::Commands::Stop(args) => commands::lifecycle::stop(args, global).await?,
        cli::Commands::Pause(args) => commands::lifecycle::pause(args, global).await?,
        cli::Commands::Resume(args) => commands::lifecycle::resume(args, global).await?,
        cli::Commands::Ps(args) => commands::ps::execute(args, global).await?,
        cli::Commands::Events(args) => commands::events::execute(args, global).await?,
        cli::Commands::State(args) => commands::state::execute(args, global).await?,
        cli::Commands::Delete(args) => commands::delete::execute(args, global).await?,
        cli::Commands::List(args) => commands::list::execute(args, global).await?,
    }

    Ok(())
}
