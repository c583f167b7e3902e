//! pifleet: build, run and watch projects on a fleet of SSH-reachable devices.
//!
//! The orchestrator side ([`fleet`], [`device`]) keeps one agent per device
//! and drives the `pifleet-ssh` executor; the executor side ([`remote`])
//! implements the command protocol over SSH.

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod fleet;
pub mod project;
pub mod remote;

pub use error::{Error, FleetError, Result};
pub use events::{EventBus, EventStream, FleetEvent};
pub use fleet::Fleet;
