//! One device of the fleet: its status machine, the executor seam and the
//! agent that runs its lanes.

pub mod agent;
pub mod runner;
pub mod state;

use std::collections::BTreeMap;
use std::fmt;

use crate::remote::protocol::RemoteCommand;
pub use agent::DeviceAgent;
pub use runner::{ProcessRunner, RemoteRunner, RunOutput};
pub use state::{Observation, Status};

/// A build-lifecycle operation the operator can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Save,
    Compile,
    Start,
    Stop,
}

/// Why a device was left out of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownDevice,
    NoProject,
    NotConnected,
    StillChecking,
    AppRunning,
    NotRunning,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Save,
        Operation::Compile,
        Operation::Start,
        Operation::Stop,
    ];

    pub fn command(&self) -> RemoteCommand {
        match self {
            Operation::Save => RemoteCommand::Save,
            Operation::Compile => RemoteCommand::Compile,
            Operation::Start => RemoteCommand::Start,
            Operation::Stop => RemoteCommand::Stop,
        }
    }

    /// The status a device must be in for this operation.
    pub fn required_status(&self) -> Status {
        match self {
            Operation::Stop => Status::AppRunning,
            _ => Status::Online,
        }
    }

    /// `None` if `status` allows the operation.
    pub fn check(&self, status: Status) -> Option<RejectReason> {
        if status == self.required_status() {
            return None;
        }
        Some(match status {
            Status::Offline => RejectReason::NotConnected,
            Status::Checking => RejectReason::StillChecking,
            Status::AppRunning => RejectReason::AppRunning,
            Status::Online => RejectReason::NotRunning,
        })
    }

    /// Banner shown when a batch of this operation settles.
    pub fn banner(&self) -> Option<&'static str> {
        match self {
            Operation::Save => Some("Save"),
            Operation::Compile => Some("Build"),
            Operation::Start | Operation::Stop => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Save => "save",
            Operation::Compile => "compile",
            Operation::Start => "start",
            Operation::Stop => "stop",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Operation {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.to_string() == s)
            .ok_or_else(|| crate::error::Error::Validation(format!("Unknown operation: {}", s)))
    }
}

/// Read-only view of a device, published by its supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub status: Status,
    /// Last error while `Offline`, empty otherwise
    pub error: String,
    pub project: String,
    /// Whether `project` names a discovered project
    pub project_valid: bool,
    pub args: BTreeMap<String, String>,
    /// Argument template of the assigned project
    pub argv_template: String,
    /// `argv_template` with this device's arguments substituted
    pub argv: String,
}
