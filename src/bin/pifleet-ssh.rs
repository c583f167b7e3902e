//! `pifleet-ssh <address> <command> <project> [extra]`
//!
//! Runs one protocol command on one device and exits with the protocol's
//! exit code. Usage errors exit with 255 like connection failures, so they
//! are never mistaken for a status answer.

use clap::error::ErrorKind;
use clap::Parser;
use log::debug;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;

use pifleet::config::Settings;
use pifleet::remote::protocol::{EXIT_CONNECTION_FAILED, EXIT_OK};
use pifleet::remote::{CommandHandler, Invocation, RemoteCommand, SSHExecutor, Workspace};

#[derive(Parser)]
#[command(name = "pifleet-ssh")]
#[command(about = "Executes one pifleet command on a device over SSH", long_about = None)]
struct Cli {
    /// Device address (host or host:port)
    address: String,

    /// status, execute, save, compile, start, stop, readOutput_once or readOutput_cont
    command: String,

    /// Project name (the shell command for `execute`)
    #[arg(allow_hyphen_values = true)]
    project: String,

    /// Projects directory for `save`, resolved arguments for `start`
    #[arg(allow_hyphen_values = true)]
    extra: Option<String>,

    /// Settings file (defaults to the per-user location)
    #[arg(long)]
    settings: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_OK,
                _ => EXIT_CONNECTION_FAILED,
            };
        }
    };

    let command: RemoteCommand = match cli.command.parse() {
        Ok(command) => command,
        Err(_) => {
            eprintln!("Unknown command: {}", cli.command);
            return EXIT_CONNECTION_FAILED;
        }
    };

    let settings = match &cli.settings {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    let settings = match settings {
        Ok(settings) => settings.with_env_overrides(),
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_CONNECTION_FAILED;
        }
    };

    let mut invocation = Invocation::new(cli.address, command, cli.project);
    if let Some(extra) = cli.extra {
        invocation = invocation.with_extra(extra);
    }

    let executor = match SSHExecutor::connect(
        &invocation.address,
        &settings.credentials,
        settings.connect_timeout(),
    ) {
        Ok(executor) => executor,
        Err(e) => {
            eprintln!("{}", connection_message(e));
            return EXIT_CONNECTION_FAILED;
        }
    };

    if command == RemoteCommand::ReadOutputContinuous {
        watch_stdin();
    }

    let handler = CommandHandler::new(
        &executor,
        Workspace::new(settings.remote_workspace.clone()),
        settings.output_tail_bytes,
    );
    let code = handler.run(&invocation, &mut io::stdout(), &mut io::stderr());
    debug!("{} on {} finished with {}", command, invocation.address, code);

    executor.disconnect();
    code
}

fn connection_message(error: pifleet::Error) -> String {
    match error {
        pifleet::Error::Connection(msg) => msg,
        other => other.to_string(),
    }
}

/// Any byte, or end of file, on stdin ends a continuous follow.
fn watch_stdin() {
    std::thread::spawn(|| {
        let mut byte = [0u8; 1];
        let _ = io::stdin().read(&mut byte);
        debug!("Cancellation requested on stdin");
        process::exit(EXIT_OK);
    });
}
