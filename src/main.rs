use anyhow::Result;
use clap::{Parser, Subcommand};

mod cli;

use cli::check::CheckCommand;
use cli::run::RunCommand;
use cli::settings::SettingsCommand;

#[derive(Parser)]
#[command(name = "pifleet")]
#[command(about = "Save, build, start and stop projects on a fleet of SSH-reachable devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run(RunCommand),
    Check(CheckCommand),
    Settings(SettingsCommand),
}

fn main() -> Result<()> {
    // Initialize logging with INFO level by default
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(cmd) => cmd.execute(),
        Commands::Check(cmd) => cmd.execute(),
        Commands::Settings(cmd) => cmd.execute(),
    }
}
