use std::path::PathBuf;

use clap::Parser;

use instafeed::app::{self, Command};

/// Instafeed - Read your Instagram feed and comment threads from the terminal.
#[derive(Parser, Debug)]
#[command(name = "instafeed", version, about)]
struct Cli {
    /// Config file to use instead of the default location.
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (equivalent to RUST_LOG=debug).
    #[arg(short = 'd', long = "debug", global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

fn main() {
    let cli = Cli::parse();
    let options = app::Options {
        config_file: cli.config,
        debug: cli.debug,
        command: cli.command,
    };

    if let Err(err) = instafeed::run(options) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}
