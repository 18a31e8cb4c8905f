// Voltron view client
//
// Connects to a running voltron server and either follows one view, printing
// each update as a JSON line, or acts as a raw protocol shell over stdin.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use voltron_core::Config;

mod client;
mod shell;
mod view;

use client::{Client, Transport};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local socket of the server (default: server.unix_socket from the config)
    #[clap(long, env = "VOLTRON_SOCKET")]
    socket: Option<PathBuf>,

    /// Connect over TCP instead (host:port)
    #[clap(long, env = "VOLTRON_TCP")]
    tcp: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow one view kind (registers, stack, disassembly, backtrace,
    /// breakpoints or an alias)
    View {
        kind: String,

        /// Poll every N milliseconds instead of waiting for the target to stop
        #[clap(long)]
        poll: Option<u64>,

        /// Exit after this many updates
        #[clap(long)]
        count: Option<usize>,
    },
    /// Forward JSON requests from stdin and print every response
    Shell,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr only - stdout carries the JSON output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voltron_view=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load().context("Failed to load configuration")?;
    let transport = Transport::resolve(args.socket, args.tcp, &config)?;
    let client = Client::connect(&transport).await?;
    info!("connected to {:?}", transport);

    match args.command {
        Command::View { kind, poll, count } => {
            let follow = view::Follow::new(&kind, &config, poll, count)?;
            follow.run(client).await
        }
        Command::Shell => shell::run(client).await,
    }
}
