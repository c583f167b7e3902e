//! The per-device status machine.
//!
//! [`transition`] is pure: it maps the current status and one observation to
//! the next status plus the output-lane effect the supervisor must apply.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Checking,
    Offline,
    Online,
    AppRunning,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Checking => "checking",
            Status::Offline => "offline",
            Status::Online => "online",
            Status::AppRunning => "app running",
        };
        f.write_str(label)
    }
}

/// What a poll, an action or the output lane reports about a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Unreachable; carries the executor's stderr
    Offline(String),
    Online,
    AppRunning,
}

impl Observation {
    pub fn status(&self) -> Status {
        match self {
            Observation::Offline(_) => Status::Offline,
            Observation::Online => Status::Online,
            Observation::AppRunning => Status::AppRunning,
        }
    }
}

/// Work the output lane has to do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEffect {
    None,
    /// Fetch the tail of the output file once
    FetchOnce,
    /// Start following the output file
    Follow,
    /// Cancel a running follow
    StopFollow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorUpdate {
    Keep,
    Set(String),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Status,
    pub effect: OutputEffect,
    pub error: ErrorUpdate,
    /// The displayed output is stale and must be discarded
    pub reset_output: bool,
}

impl Transition {
    pub fn changed(&self, from: Status) -> bool {
        self.next != from
    }
}

pub fn transition(current: Status, observed: &Observation) -> Transition {
    let next = observed.status();

    let effect = match (current, next) {
        (Status::Checking | Status::Offline, Status::Online) => OutputEffect::FetchOnce,
        (Status::Checking | Status::Offline | Status::Online, Status::AppRunning) => {
            OutputEffect::Follow
        }
        (Status::AppRunning, Status::Online) => OutputEffect::StopFollow,
        (from, Status::Offline) if from != Status::Offline => OutputEffect::StopFollow,
        _ => OutputEffect::None,
    };

    let error = match observed {
        Observation::Offline(text) => ErrorUpdate::Set(text.clone()),
        _ if current == Status::Offline => ErrorUpdate::Clear,
        _ => ErrorUpdate::Keep,
    };

    Transition {
        next,
        effect,
        error,
        reset_output: current == Status::Offline && next == Status::Online,
    }
}
