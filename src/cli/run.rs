//! Interactive console: loads the fleet, reads commands from stdin and prints
//! fleet events as they arrive.

use anyhow::Result;
use clap::Args;
use log::debug;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use pifleet::device::{Operation, ProcessRunner, Status};
use pifleet::{EventBus, EventStream, Fleet, FleetEvent};

const HELP: &str = "\
Commands:
  list                          devices with status, project and arguments
  projects                      discovered projects
  select <device>... | all | none
  save | compile | start | stop [device...]   (defaults to the selection)
  output <device>               output received from a device
  error <device>                last error of an offline device
  assign <device> <project>     assign a project and rewrite the testbed
  arg <device> <name> [value]   set an argument (no value removes it)
  refresh                       reload testbed and projects
  quit";

#[derive(Args)]
#[command(about = "Operate the fleet from an interactive console")]
pub struct RunCommand {
    /// Testbed file (overrides the settings)
    #[arg(long)]
    pub testbed: Option<PathBuf>,

    /// Settings file (defaults to the per-user location)
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Delay between status polls in milliseconds
    #[arg(long)]
    pub poll_interval: Option<u64>,
}

impl RunCommand {
    pub fn execute(&self) -> Result<()> {
        let mut settings = super::load_settings(self.settings.as_deref())?;
        if let Some(testbed) = &self.testbed {
            settings = settings.with_testbed(testbed.clone());
        }
        if let Some(ms) = self.poll_interval {
            settings = settings.with_poll_interval(Duration::from_millis(ms));
        }

        let mut runner = ProcessRunner::new(settings.executor_path());
        if let Some(path) = &self.settings {
            runner = runner.with_args(["--settings".to_string(), path.display().to_string()]);
        }

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(async move {
            let (events, stream) = EventBus::channel();
            let (fleet, report) = Fleet::load(settings, Arc::new(runner), events)?;
            if !report.is_clean() {
                print!("{}", report);
            }

            let mut console = Console::new(fleet);
            println!("{} device(s) loaded. Type 'help' for commands.", console.fleet.devices().count());
            console.run(stream).await
        })
    }
}

/// One parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    List,
    Projects,
    Select(Vec<String>),
    SelectAll,
    SelectNone,
    Dispatch(Operation, Vec<String>),
    Output(String),
    Error(String),
    Assign { device: String, project: String },
    Arg { device: String, name: String, value: String },
    Refresh,
    Quit,
    Empty,
}

pub fn parse_line(line: &str) -> std::result::Result<ConsoleCommand, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&head, rest)) = words.split_first() else {
        return Ok(ConsoleCommand::Empty);
    };
    let owned = |words: &[&str]| words.iter().map(|w| w.to_string()).collect::<Vec<_>>();

    let command = match (head, rest) {
        ("help" | "?", _) => ConsoleCommand::Help,
        ("list" | "ls", _) => ConsoleCommand::List,
        ("projects", _) => ConsoleCommand::Projects,
        ("select", ["all"]) => ConsoleCommand::SelectAll,
        ("select", ["none"]) => ConsoleCommand::SelectNone,
        ("select", []) => return Err("usage: select <device>... | all | none".to_string()),
        ("select", names) => ConsoleCommand::Select(owned(names)),
        ("output", [device]) => ConsoleCommand::Output(device.to_string()),
        ("error", [device]) => ConsoleCommand::Error(device.to_string()),
        ("assign", [device, project]) => ConsoleCommand::Assign {
            device: device.to_string(),
            project: project.to_string(),
        },
        ("arg", [device, name]) => ConsoleCommand::Arg {
            device: device.to_string(),
            name: name.to_string(),
            value: String::new(),
        },
        ("arg", [device, name, value]) => ConsoleCommand::Arg {
            device: device.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        },
        ("refresh", []) => ConsoleCommand::Refresh,
        ("quit" | "exit", []) => ConsoleCommand::Quit,
        (op, names) => match op.parse::<Operation>() {
            Ok(operation) => ConsoleCommand::Dispatch(operation, owned(names)),
            Err(_) => return Err(format!("Unknown command: {} (try 'help')", line.trim())),
        },
    };
    Ok(command)
}

struct Console {
    fleet: Fleet,
    selection: Vec<String>,
    transcripts: HashMap<String, String>,
}

impl Console {
    fn new(fleet: Fleet) -> Self {
        Self {
            fleet,
            selection: Vec::new(),
            transcripts: HashMap::new(),
        }
    }

    async fn run(mut self, mut events: EventStream) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match parse_line(&line) {
                        Ok(ConsoleCommand::Quit) => break,
                        Ok(command) => {
                            if let Err(e) = self.apply(command, &mut events).await {
                                println!("✗ {}", e);
                            }
                        }
                        Err(e) => println!("{}", e),
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.show(event),
                    None => break,
                },
            }
        }

        println!("Stopping devices...");
        self.fleet.shutdown().await;
        Ok(())
    }

    fn show(&mut self, event: FleetEvent) {
        match &event {
            FleetEvent::OutputReset { device } => {
                self.transcripts.remove(device);
            }
            FleetEvent::Output { device, chunk } => {
                self.transcripts
                    .entry(device.clone())
                    .or_default()
                    .push_str(chunk);
            }
            _ => {}
        }
        println!("{}", event);
    }

    async fn apply(&mut self, command: ConsoleCommand, events: &mut EventStream) -> pifleet::Result<()> {
        match command {
            ConsoleCommand::Empty => {}
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::List => self.list(),
            ConsoleCommand::Projects => {
                for name in self.fleet.catalog().names() {
                    println!("  {}", name);
                }
            }
            ConsoleCommand::Select(names) => {
                for name in &names {
                    if self.fleet.device(name).is_none() {
                        return Err(pifleet::Error::UnknownDevice(name.clone()));
                    }
                }
                self.selection = names;
                println!("Selected: {}", self.selection.join(", "));
            }
            ConsoleCommand::SelectAll => {
                self.selection = self.fleet.devices().map(|d| d.name().to_string()).collect();
                println!("Selected: {}", self.selection.join(", "));
            }
            ConsoleCommand::SelectNone => self.selection.clear(),
            ConsoleCommand::Dispatch(operation, names) => {
                let names = if names.is_empty() {
                    self.selection.clone()
                } else {
                    names
                };
                let report = self.fleet.dispatch(operation, &names)?;
                print!("{}", report);
            }
            ConsoleCommand::Output(device) => {
                self.fleet.snapshot(&device)?;
                match self.transcripts.get(&device) {
                    Some(text) => println!("{}:\n{}", device, text),
                    None => println!("{}: (no output)", device),
                }
            }
            ConsoleCommand::Error(device) => {
                let snapshot = self.fleet.snapshot(&device)?;
                if snapshot.status == Status::Offline {
                    println!("Error: {}", snapshot.error);
                } else {
                    println!("{} is {}", device, snapshot.status);
                }
            }
            ConsoleCommand::Assign { device, project } => {
                self.fleet.assign(&device, &project)?;
                println!("{} now runs {}", device, project);
            }
            ConsoleCommand::Arg {
                device,
                name,
                value,
            } => self.fleet.set_argument(&device, &name, &value)?,
            ConsoleCommand::Refresh => {
                self.fleet.stop().await?;
                // Whatever the old devices queued describes devices that are gone
                let stale = std::iter::from_fn(|| events.try_recv()).count();
                debug!("Discarded {} event(s) of the previous fleet", stale);
                self.selection.clear();
                self.transcripts.clear();

                let report = self.fleet.reload()?;
                print!("{}", report);
                println!("{} device(s) loaded.", self.fleet.devices().count());
            }
            ConsoleCommand::Quit => {}
        }
        Ok(())
    }

    fn list(&self) {
        for device in self.fleet.devices() {
            let snapshot = device.snapshot();
            let project = match (snapshot.project.is_empty(), snapshot.project_valid) {
                (true, _) => "(unassigned)".to_string(),
                (false, true) => snapshot.project.clone(),
                (false, false) => format!("{} (invalid)", snapshot.project),
            };
            let marker = if self.selection.iter().any(|s| s == device.name()) {
                "*"
            } else {
                " "
            };
            println!(
                "{} {} | {} | {} | {} | {}",
                marker,
                device.name(),
                device.address(),
                snapshot.status,
                project,
                snapshot.argv
            );
        }
    }
}
