#![deny(unsafe_code)]
pub mod commands;
mod version;

use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::Parser;
use commands::basecaller::Basecaller;
use commands::command::Command;
use enum_dispatch::enum_dispatch;
use env_logger::Env;
use log::{error, info};

/// Custom styles for CLI help output
const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(styles = STYLES)]
struct Args {
    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[enum_dispatch(Command)]
#[derive(Parser, Debug)]
#[command(version)]
enum Subcommand {
    #[command(display_order = 1)]
    Basecaller(Basecaller),
}

fn main() {
    let verbose = std::env::args().any(|arg| arg == "-v" || arg == "--verbose");
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    // Capture the full command line BEFORE clap parsing for the @PG line.
    let command_line = std::env::args().collect::<Vec<_>>().join(" ");

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) {
                e.exit();
            }
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    info!("Running squall version {}", version::VERSION);
    if let Err(e) = args.subcommand.execute(&command_line) {
        error!("{e:#}");
        std::process::exit(1);
    }
    info!("> Finished");
}
