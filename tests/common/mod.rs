#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use pifleet::config::Settings;
use pifleet::device::runner::{CancelOutcome, FollowControl, FollowEvent, OutputFollow};
use pifleet::device::{RemoteRunner, RunOutput, Status};
use pifleet::remote::{Invocation, RemoteCommand};
use pifleet::{EventStream, Fleet, FleetEvent};

pub const WAIT: Duration = Duration::from_secs(5);

/// A follow started by the fake runner; the test drives it.
#[derive(Clone)]
pub struct FakeFollow {
    pub invocation: Invocation,
    pub sender: mpsc::UnboundedSender<FollowEvent>,
    pub cancels: Arc<AtomicUsize>,
}

impl FakeFollow {
    pub fn chunk(&self, text: &str) {
        let _ = self.sender.send(FollowEvent::Chunk(text.to_string()));
    }

    pub fn end(&self, exit_code: i32, stderr: &str) {
        let _ = self.sender.send(FollowEvent::Ended(RunOutput {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }));
    }

    pub fn cancelled(&self) -> bool {
        self.cancels.load(Ordering::SeqCst) > 0
    }
}

struct FakeControl {
    cancels: Arc<AtomicUsize>,
}

#[async_trait]
impl FollowControl for FakeControl {
    async fn cancel(&mut self, _grace: Duration) -> CancelOutcome {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        CancelOutcome::Graceful
    }
}

#[derive(Default)]
struct FakeState {
    /// Exit code of `status` per address; 2 (online) if absent
    status: HashMap<String, (i32, String)>,
    results: HashMap<RemoteCommand, RunOutput>,
    action_delay: Duration,
    calls: Vec<Invocation>,
    follows: Vec<FakeFollow>,
}

/// Scripted stand-in for the executor.
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<FakeState>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, address: &str, exit_code: i32, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .status
            .insert(address.to_string(), (exit_code, stderr.to_string()));
    }

    pub fn set_result(&self, command: RemoteCommand, output: RunOutput) {
        self.state.lock().unwrap().results.insert(command, output);
    }

    pub fn set_action_delay(&self, delay: Duration) {
        self.state.lock().unwrap().action_delay = delay;
    }

    pub fn calls(&self, command: RemoteCommand, address: &str) -> Vec<Invocation> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.command == command && c.address == address)
            .cloned()
            .collect()
    }

    pub fn follows(&self, address: &str) -> Vec<FakeFollow> {
        self.state
            .lock()
            .unwrap()
            .follows
            .iter()
            .filter(|f| f.invocation.address == address)
            .cloned()
            .collect()
    }
}

pub fn ok(stdout: &str) -> RunOutput {
    RunOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

#[async_trait]
impl RemoteRunner for FakeRunner {
    async fn run(&self, invocation: Invocation) -> RunOutput {
        let (output, delay) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(invocation.clone());

            if invocation.command == RemoteCommand::Status {
                let (code, stderr) = state
                    .status
                    .get(&invocation.address)
                    .cloned()
                    .unwrap_or((2, String::new()));
                let output = RunOutput {
                    exit_code: Some(code),
                    stdout: String::new(),
                    stderr,
                };
                (output, Duration::ZERO)
            } else {
                let output = state
                    .results
                    .get(&invocation.command)
                    .cloned()
                    .unwrap_or_else(|| ok(&format!("{} done\n", invocation.command)));
                (output, state.action_delay)
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        output
    }

    async fn follow(&self, invocation: Invocation) -> pifleet::Result<OutputFollow> {
        let (sender, events) = mpsc::unbounded_channel();
        let cancels = Arc::new(AtomicUsize::new(0));

        let mut state = self.state.lock().unwrap();
        state.calls.push(invocation.clone());
        state.follows.push(FakeFollow {
            invocation,
            sender,
            cancels: cancels.clone(),
        });

        Ok(OutputFollow {
            events,
            control: Box::new(FakeControl { cancels }),
        })
    }
}

/// A testbed directory with the projects `Blink` and `Plain`.
pub struct Workspace {
    pub dir: TempDir,
    pub testbed: PathBuf,
}

impl Workspace {
    pub fn new(devices: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let projects = dir.path().join("projects");

        let blink = projects.join("Blink");
        fs::create_dir_all(&blink).unwrap();
        fs::write(blink.join("makefile"), "all:\n").unwrap();
        fs::write(blink.join("config.txt"), "argv=--delay %delay% --pin %pin%\n").unwrap();

        let plain = projects.join("Plain");
        fs::create_dir_all(&plain).unwrap();
        fs::write(plain.join("makefile"), "all:\n").unwrap();

        let testbed = dir.path().join("testbed.txt");
        fs::write(
            &testbed,
            format!("projectsPath={}\n\n{}", projects.display(), devices),
        )
        .unwrap();

        Self { dir, testbed }
    }

    pub fn settings(&self) -> Settings {
        Settings::default()
            .with_testbed(self.testbed.clone())
            .with_poll_interval(Duration::from_millis(20))
            .with_cancel_grace(Duration::from_millis(100))
    }
}

pub const TWO_DEVICES: &str = "\
[pi-01]
address=10.0.0.1
project=Blink
args=delay:500,pin:17

[pi-02]
address=10.0.0.2
project=Plain
args=
";

pub async fn wait_for_status(fleet: &Fleet, device: &str, status: Status) {
    let mut rx = fleet.device(device).expect("device exists").subscribe();
    tokio::time::timeout(WAIT, async {
        loop {
            if rx.borrow_and_update().status == status {
                return;
            }
            rx.changed().await.expect("device still running");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached {}", device, status));
}

/// Collects events up to and including the first one matching `pred`.
pub async fn events_until<F>(stream: &mut EventStream, pred: F) -> Vec<FleetEvent>
where
    F: Fn(&FleetEvent) -> bool,
{
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        while let Some(event) = stream.recv().await {
            let done = pred(&event);
            seen.push(event);
            if done {
                return;
            }
        }
        panic!("event stream closed");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out, events so far: {:?}", seen));
    seen
}
