//! The binary entrypoint for `zim`, the cacheable build orchestrator.

use clap::{Parser, Subcommand, crate_version};
use color_eyre::Result;
use tracing_subscriber::util::SubscriberInitExt;

// Since this is a binary crate, these modules aren't pub so that they can
// correctly warn about dead code.
mod cmd;
mod log;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "zim",
    about = "A caching build orchestrator for multi-component repositories",
    version = crate_version!(),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run rules and everything they require
    Run(cmd::run::Opts),

    /// List components and their rules
    Ls(cmd::ls::Opts),

    /// Print the cache key of each named rule
    Key(cmd::key::Opts),
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    log::make_logger(std::io::stderr, top.color)?.init();
    match top.command {
        Command::Run(opts) => cmd::run::exec(opts),
        Command::Ls(opts) => cmd::ls::exec(opts),
        Command::Key(opts) => cmd::key::exec(opts),
    }
}
