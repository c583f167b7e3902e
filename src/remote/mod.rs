//! Remote side of the fleet: the executor protocol and its SSH transport.
//!
//! The orchestrator never talks SSH itself. It spawns the `pifleet-ssh`
//! executor, which connects through [`executor::SSHExecutor`], runs one
//! [`protocol::RemoteCommand`] via [`commands::CommandHandler`] and reports
//! the outcome through its exit code.

pub mod commands;
pub mod diagnostics;
pub mod executor;
pub mod protocol;
pub mod transfer;

pub use commands::{CommandHandler, RemoteShell};
pub use diagnostics::{diagnose_command_failure, diagnose_ssh_error};
pub use executor::{ExecutionResult, SSHExecutor};
pub use protocol::{Invocation, RemoteCommand, Workspace};
pub use transfer::{ProjectTree, SftpTransfer, TransferResult};
