use clap::Parser;

use broadcast_recorder::Cli;

fn main() -> anyhow::Result<()> {
    broadcast_recorder::init_logging();
    broadcast_recorder::run(Cli::parse())
}
