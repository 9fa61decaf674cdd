use anyhow::Result;
use clap::Parser;

mod camera;
mod cli;
mod command;
mod context;
mod error;
mod lifecycle;
mod port;
mod queue;
mod receiver;
mod relay;
mod send;
mod stats;
mod transmitter;
mod watch;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = cli::Cli::parse();
    match args.cmd {
        cli::Cmd::Relay(opts) => relay::run(opts),
        cli::Cmd::Send(opts) => send::run(opts),
        cli::Cmd::Watch(opts) => watch::run(opts),
    }
}
