//! One device's supervisor and its three lanes.
//!
//! ```text
//!              ┌────────────┐  Polled/ack   ┌──────────────┐
//!              │ poll lane  │ ────────────▶ │              │ ──▶ watch snapshot
//!              └────────────┘               │              │
//!              ┌────────────┐  ActionDone   │  supervisor  │ ──▶ fleet events
//!  Dispatch ─▶ │ action lane│ ◀──────────── │              │
//!              └────────────┘               │              │
//!              ┌────────────┐  FollowEnded  │              │
//!              │ output lane│ ◀───────────▶ │              │
//!              └────────────┘               └──────────────┘
//! ```
//!
//! Only the supervisor mutates the device's state. Lanes talk to it through
//! its mailbox and never share state with each other. Cancelling the token
//! stops every lane; after that no event is emitted for the device.

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::runner::{FollowEvent, OutputFollow, RemoteRunner, RunOutput};
use super::state::{transition, ErrorUpdate, Observation, OutputEffect, Status};
use super::{DeviceSnapshot, Operation};
use crate::config::testbed::DeviceEntry;
use crate::events::{EventBus, FleetEvent};
use crate::fleet::batch::BatchTracker;
use crate::project::{resolve_template, Project};
use crate::remote::protocol::{
    classify_status, Invocation, RemoteCommand, EXIT_CONNECTION_FAILED,
};

/// Shown when the executor produced no exit code at all.
pub const EXECUTOR_NOT_STARTED: &str = "SSH executable couldn't be started.";

/// Everything an agent shares with the rest of the fleet.
#[derive(Clone)]
pub struct AgentContext {
    pub runner: Arc<dyn RemoteRunner>,
    pub events: EventBus,
    pub batch: Arc<BatchTracker>,
    /// Passed to `save` so the executor finds the local sources
    pub projects_path: PathBuf,
    pub poll_interval: Duration,
    pub cancel_grace: Duration,
}

enum Message {
    Polled {
        observation: Observation,
        ack: oneshot::Sender<()>,
    },
    ActionDone {
        operation: Operation,
        output: RunOutput,
    },
    FollowEnded(RunOutput),
    Dispatch(Operation),
    Assign {
        project: String,
        template: Option<String>,
    },
    SetArgs(BTreeMap<String, String>),
}

struct ActionJob {
    operation: Operation,
    invocation: Invocation,
}

enum OutputCommand {
    Once(Invocation),
    Follow(Invocation),
    Stop,
}

/// Handle to a running device.
pub struct DeviceAgent {
    name: String,
    address: String,
    mailbox: mpsc::UnboundedSender<Message>,
    snapshot: watch::Receiver<DeviceSnapshot>,
    token: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

impl DeviceAgent {
    /// Spawns the supervisor and lanes. Must be called inside a tokio runtime.
    ///
    /// `project` is `None` when the entry names no discovered project; the
    /// device is still polled but cannot run operations.
    pub fn spawn(entry: &DeviceEntry, project: Option<&Project>, ctx: AgentContext) -> Self {
        let argv_template = project.map(|p| p.argv_template.clone()).unwrap_or_default();
        let initial = DeviceSnapshot {
            status: Status::Checking,
            error: String::new(),
            project: entry.project.clone(),
            project_valid: project.is_some(),
            argv: resolve_template(&argv_template, &entry.args),
            args: entry.args.clone(),
            argv_template,
        };

        let (snapshot_tx, snapshot_rx) = watch::channel(initial.clone());
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let poll = tokio::spawn(poll_lane(
            entry.address.clone(),
            ctx.runner.clone(),
            snapshot_rx.clone(),
            mailbox_tx.clone(),
            ctx.poll_interval,
            token.clone(),
        ));
        let action = tokio::spawn(action_lane(
            ctx.runner.clone(),
            action_rx,
            mailbox_tx.clone(),
            token.clone(),
        ));
        let output = tokio::spawn(output_lane(
            entry.name.clone(),
            ctx.runner.clone(),
            output_rx,
            mailbox_tx.clone(),
            ctx.events.clone(),
            ctx.cancel_grace,
            token.clone(),
        ));

        let supervisor = Supervisor {
            name: entry.name.clone(),
            address: entry.address.clone(),
            state: initial,
            snapshot: snapshot_tx,
            action_tx,
            output_tx,
            ctx,
            token: token.clone(),
        };
        let handle = tokio::spawn(supervisor.run(mailbox_rx, [poll, action, output]));

        info!("Device {} ({}) started", entry.name, entry.address);

        Self {
            name: entry.name.clone(),
            address: entry.address.clone(),
            mailbox: mailbox_tx,
            snapshot: snapshot_rx,
            token,
            supervisor: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current state as last published by the supervisor.
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.clone()
    }

    /// Queues `operation` on the action lane. Returns false if the device is
    /// shutting down.
    pub fn dispatch(&self, operation: Operation) -> bool {
        self.send(Message::Dispatch(operation))
    }

    /// Changes the assigned project. `project` is `None` for a name that is
    /// not a discovered project.
    pub fn assign(&self, name: &str, project: Option<&Project>) -> bool {
        self.send(Message::Assign {
            project: name.to_string(),
            template: project.map(|p| p.argv_template.clone()),
        })
    }

    /// Replaces the argument map.
    pub fn set_args(&self, args: BTreeMap<String, String>) -> bool {
        self.send(Message::SetArgs(args))
    }

    fn send(&self, message: Message) -> bool {
        !self.token.is_cancelled() && self.mailbox.send(message).is_ok()
    }

    /// Stops the lanes and waits for them. A running output follow gets its
    /// grace period before it is killed.
    pub async fn shutdown(mut self) {
        debug!("Stopping device {}", self.name);
        self.token.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                warn!("Supervisor of {} ended abnormally: {}", self.name, e);
            }
        }
    }
}

impl Drop for DeviceAgent {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Supervisor {
    name: String,
    address: String,
    state: DeviceSnapshot,
    snapshot: watch::Sender<DeviceSnapshot>,
    action_tx: mpsc::UnboundedSender<ActionJob>,
    output_tx: mpsc::UnboundedSender<OutputCommand>,
    ctx: AgentContext,
    token: CancellationToken,
}

impl Supervisor {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Message>, lanes: [JoinHandle<()>; 3]) {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                message = mailbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
            }
        }

        // Closing the lane queues lets idle lanes return even before they
        // observe the token
        drop(self.action_tx);
        drop(self.output_tx);
        for lane in lanes {
            if let Err(e) = lane.await {
                warn!("Lane of {} ended abnormally: {}", self.name, e);
            }
        }
        debug!("Device {} stopped", self.name);
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Polled { observation, ack } => {
                self.observe(observation);
                let _ = ack.send(());
            }
            Message::ActionDone { operation, output } => self.action_done(operation, output),
            Message::FollowEnded(output) => {
                if output.exit_code == Some(EXIT_CONNECTION_FAILED) {
                    self.observe(Observation::Offline(output.stderr.trim().to_string()));
                } else {
                    debug!(
                        "Output follow of {} ended with {:?}",
                        self.name, output.exit_code
                    );
                }
            }
            Message::Dispatch(operation) => self.dispatch(operation),
            Message::Assign { project, template } => {
                self.state.project = project;
                self.state.project_valid = template.is_some();
                self.state.argv_template = template.unwrap_or_default();
                self.resolve_argv();
            }
            Message::SetArgs(args) => {
                self.state.args = args;
                self.resolve_argv();
            }
        }
    }

    fn emit(&self, event: FleetEvent) {
        if !self.token.is_cancelled() {
            self.ctx.events.emit(event);
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.state.clone());
    }

    fn invocation(&self, command: RemoteCommand) -> Invocation {
        Invocation::new(self.address.clone(), command, self.state.project.clone())
    }

    fn resolve_argv(&mut self) {
        self.state.argv = resolve_template(&self.state.argv_template, &self.state.args);
        self.publish();
    }

    /// Applies one observation through the status machine.
    fn observe(&mut self, observation: Observation) {
        let previous = self.state.status;
        let t = transition(previous, &observation);

        match &t.error {
            ErrorUpdate::Set(error) => self.state.error = error.clone(),
            ErrorUpdate::Clear => self.state.error.clear(),
            ErrorUpdate::Keep => {}
        }
        self.state.status = t.next;
        self.publish();

        if t.changed(previous) {
            info!("{}: {} -> {}", self.name, previous, t.next);
            if t.reset_output {
                self.emit(FleetEvent::OutputReset {
                    device: self.name.clone(),
                });
            }
            self.emit(FleetEvent::StatusChanged {
                device: self.name.clone(),
                previous,
                current: t.next,
                error: (t.next == Status::Offline).then(|| self.state.error.clone()),
            });
        }

        let command = match t.effect {
            OutputEffect::None => None,
            OutputEffect::FetchOnce => Some(OutputCommand::Once(
                self.invocation(RemoteCommand::ReadOutputOnce),
            )),
            OutputEffect::Follow => Some(OutputCommand::Follow(
                self.invocation(RemoteCommand::ReadOutputContinuous),
            )),
            OutputEffect::StopFollow => Some(OutputCommand::Stop),
        };
        if let Some(command) = command {
            let _ = self.output_tx.send(command);
        }
    }

    fn dispatch(&mut self, operation: Operation) {
        let mut invocation = self.invocation(operation.command());
        match operation {
            Operation::Save => {
                invocation = invocation.with_extra(self.ctx.projects_path.display().to_string())
            }
            Operation::Start => invocation = invocation.with_extra(self.state.argv.clone()),
            Operation::Compile | Operation::Stop => {}
        }

        debug!("{}: dispatching {}", self.name, operation);
        if self
            .action_tx
            .send(ActionJob {
                operation,
                invocation,
            })
            .is_err()
        {
            warn!("Action lane of {} is gone", self.name);
        }
    }

    fn action_done(&mut self, operation: Operation, output: RunOutput) {
        if self.token.is_cancelled() {
            return;
        }

        let success = output.success();
        let text = if success {
            output.stdout
        } else if output.exit_code.is_none() {
            warn!("{}: {}", self.name, output.stderr.trim());
            EXECUTOR_NOT_STARTED.to_string()
        } else {
            output.stderr
        };

        self.emit(FleetEvent::ActionFinished {
            device: self.name.clone(),
            operation,
            success,
            text,
        });

        if success {
            match operation {
                Operation::Start => {
                    // A poll may already have seen the application and started
                    // following its output
                    if self.state.status != Status::AppRunning {
                        self.emit(FleetEvent::OutputReset {
                            device: self.name.clone(),
                        });
                    }
                    self.observe(Observation::AppRunning);
                }
                Operation::Stop => self.observe(Observation::Online),
                Operation::Save | Operation::Compile => {}
            }
        }

        self.ctx.batch.settle();
    }
}

/// Polls status, waits for the supervisor to apply it, sleeps, repeats.
async fn poll_lane(
    address: String,
    runner: Arc<dyn RemoteRunner>,
    snapshot: watch::Receiver<DeviceSnapshot>,
    mailbox: mpsc::UnboundedSender<Message>,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        let project = snapshot.borrow().project.clone();
        let invocation = Invocation::new(address.clone(), RemoteCommand::Status, project);

        let output = tokio::select! {
            _ = token.cancelled() => break,
            output = runner.run(invocation) => output,
        };
        let observation = classify_status(output.exit_code, &output.stderr);

        let (ack_tx, ack_rx) = oneshot::channel();
        if mailbox
            .send(Message::Polled {
                observation,
                ack: ack_tx,
            })
            .is_err()
        {
            break;
        }

        tokio::select! {
            _ = token.cancelled() => break,
            ack = ack_rx => if ack.is_err() { break },
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Runs queued operations one at a time.
async fn action_lane(
    runner: Arc<dyn RemoteRunner>,
    mut jobs: mpsc::UnboundedReceiver<ActionJob>,
    mailbox: mpsc::UnboundedSender<Message>,
    token: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = token.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let output = tokio::select! {
            _ = token.cancelled() => break,
            output = runner.run(job.invocation) => output,
        };

        if mailbox
            .send(Message::ActionDone {
                operation: job.operation,
                output,
            })
            .is_err()
        {
            break;
        }
    }
}

/// Next event of the running follow; pending forever if there is none.
async fn next_follow_event(follow: &mut Option<OutputFollow>) -> Option<FollowEvent> {
    match follow {
        Some(follow) => follow.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Fetches or follows the application's output. Any new command first
/// cancels a running follow.
async fn output_lane(
    device: String,
    runner: Arc<dyn RemoteRunner>,
    mut commands: mpsc::UnboundedReceiver<OutputCommand>,
    mailbox: mpsc::UnboundedSender<Message>,
    events: EventBus,
    grace: Duration,
    token: CancellationToken,
) {
    let mut follow: Option<OutputFollow> = None;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };

                if let Some(running) = follow.take() {
                    finish_follow(&device, running, grace, &events, &token).await;
                }

                match command {
                    OutputCommand::Once(invocation) => {
                        let output = tokio::select! {
                            _ = token.cancelled() => break,
                            output = runner.run(invocation) => output,
                        };
                        if output.success() && !token.is_cancelled() {
                            events.emit(FleetEvent::Output {
                                device: device.clone(),
                                chunk: output.stdout,
                            });
                        }
                    }
                    OutputCommand::Follow(invocation) => match runner.follow(invocation).await {
                        Ok(started) => follow = Some(started),
                        Err(e) => warn!("{}: cannot follow output: {}", device, e),
                    },
                    OutputCommand::Stop => {}
                }
            }
            event = next_follow_event(&mut follow) => match event {
                Some(FollowEvent::Chunk(chunk)) => {
                    if !token.is_cancelled() {
                        events.emit(FleetEvent::Output {
                            device: device.clone(),
                            chunk,
                        });
                    }
                }
                Some(FollowEvent::Ended(output)) => {
                    follow = None;
                    let _ = mailbox.send(Message::FollowEnded(output));
                }
                None => follow = None,
            },
        }
    }

    if let Some(running) = follow.take() {
        finish_follow(&device, running, grace, &events, &token).await;
    }
}

/// Cancels a follow, emitting every chunk it produced up to its end.
async fn finish_follow(
    device: &str,
    mut running: OutputFollow,
    grace: Duration,
    events: &EventBus,
    token: &CancellationToken,
) {
    forward_queued(device, &mut running, events, token);
    let outcome = running.control.cancel(grace).await;
    forward_queued(device, &mut running, events, token);
    debug!("{}: output follow stopped ({:?})", device, outcome);
}

/// Emits the chunks already queued by a follow.
fn forward_queued(
    device: &str,
    running: &mut OutputFollow,
    events: &EventBus,
    token: &CancellationToken,
) {
    while let Ok(event) = running.events.try_recv() {
        match event {
            FollowEvent::Chunk(chunk) => {
                if !token.is_cancelled() {
                    events.emit(FleetEvent::Output {
                        device: device.to_string(),
                        chunk,
                    });
                }
            }
            FollowEvent::Ended(output) => {
                debug!("{}: follow ended with {:?} while stopping", device, output.exit_code)
            }
        }
    }
}
