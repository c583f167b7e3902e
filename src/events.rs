//! Fleet events and the channel that carries them to the operator.
//!
//! Every event goes through one unbounded mpsc channel, so output chunks are
//! never dropped and arrive in the order they were emitted.

use log::debug;
use std::fmt;
use tokio::sync::mpsc;

use crate::device::{Operation, Status};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    StatusChanged {
        device: String,
        previous: Status,
        current: Status,
        /// Error text when `current` is `Offline`
        error: Option<String>,
    },
    /// Previously shown output of this device is stale
    OutputReset { device: String },
    Output { device: String, chunk: String },
    ActionFinished {
        device: String,
        operation: Operation,
        success: bool,
        /// stdout on success, stderr on failure
        text: String,
    },
    BatchStarted { operation: Operation, devices: usize },
    BatchFinished { operation: Operation },
}

impl FleetEvent {
    /// Device the event belongs to, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            FleetEvent::StatusChanged { device, .. }
            | FleetEvent::OutputReset { device }
            | FleetEvent::Output { device, .. }
            | FleetEvent::ActionFinished { device, .. } => Some(device),
            FleetEvent::BatchStarted { .. } | FleetEvent::BatchFinished { .. } => None,
        }
    }
}

impl fmt::Display for FleetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetEvent::StatusChanged {
                device,
                previous,
                current,
                error,
            } => {
                write!(f, "{}: {} -> {}", device, previous, current)?;
                if let Some(error) = error {
                    write!(f, " (Error: {})", error)?;
                }
                Ok(())
            }
            FleetEvent::OutputReset { device } => write!(f, "{}: output cleared", device),
            FleetEvent::Output { device, chunk } => write!(f, "{}:\n{}", device, chunk),
            FleetEvent::ActionFinished {
                device,
                success,
                text,
                ..
            } => {
                let marker = if *success { "" } else { "[failed] " };
                write!(f, "{}: {}{}", device, marker, text.trim_end())
            }
            FleetEvent::BatchStarted { operation, devices } => {
                write!(f, "{} dispatched to {} device(s)", operation, devices)
            }
            FleetEvent::BatchFinished { operation } => match operation.banner() {
                Some(banner) => write!(f, "----- {} finished -----", banner),
                None => write!(f, "{} finished", operation),
            },
        }
    }
}

/// Sending side, cloned into every agent and the batch tracker.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: mpsc::UnboundedSender<FleetEvent>,
}

/// Receiving side, owned by the front end.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<FleetEvent>,
}

impl EventBus {
    pub fn channel() -> (Self, EventStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, EventStream { receiver })
    }

    pub fn emit(&self, event: FleetEvent) {
        if self.sender.send(event).is_err() {
            debug!("No subscriber listening to fleet events");
        }
    }
}

impl EventStream {
    /// Next event; `None` once every bus handle is gone.
    pub async fn recv(&mut self) -> Option<FleetEvent> {
        self.receiver.recv().await
    }

    /// Next event without waiting.
    pub fn try_recv(&mut self) -> Option<FleetEvent> {
        self.receiver.try_recv().ok()
    }
}
