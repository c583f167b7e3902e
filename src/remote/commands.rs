//! Device-side implementation of each executor command.
//!
//! Every command goes through [`CommandHandler::run`], which executes it over
//! an open session and folds the outcome into one exit code of the protocol.
//! The session is reached through [`RemoteShell`], implemented by
//! [`SSHExecutor`].

use crate::error::{Error, Result};
use crate::remote::diagnostics::diagnose_command_failure;
use crate::remote::executor::{ExecutionResult, SSHExecutor};
use crate::remote::protocol::{
    Invocation, RemoteCommand, Workspace, EXIT_APP_NOT_RUNNING, EXIT_APP_RUNNING,
    EXIT_COMMAND_FAILED, EXIT_CONNECTION_FAILED, EXIT_OK,
};
use crate::remote::transfer::{SftpTransfer, TransferResult};
use log::{debug, warn};
use std::io::Write;
use std::path::Path;

/// What the command handler needs from a connected device.
pub trait RemoteShell {
    fn execute(&self, script: &str) -> Result<ExecutionResult>;

    /// Runs `script`, handing stdout to `on_chunk` as it arrives.
    fn execute_streaming(&self, script: &str, on_chunk: &mut dyn FnMut(&[u8])) -> Result<ExecutionResult>;

    /// Copies `<projects_root>/<project>` into `workspace`.
    fn upload_project(&self, workspace: &Workspace, projects_root: &Path, project: &str) -> Result<TransferResult>;
}

impl RemoteShell for SSHExecutor {
    fn execute(&self, script: &str) -> Result<ExecutionResult> {
        SSHExecutor::execute(self, script)
    }

    fn execute_streaming(&self, script: &str, on_chunk: &mut dyn FnMut(&[u8])) -> Result<ExecutionResult> {
        SSHExecutor::execute_streaming(self, script, |chunk| on_chunk(chunk))
    }

    fn upload_project(&self, workspace: &Workspace, projects_root: &Path, project: &str) -> Result<TransferResult> {
        SftpTransfer::new(self, workspace).upload_project(projects_root, project)
    }
}

/// Runs protocol commands on one connected device.
pub struct CommandHandler<'a> {
    shell: &'a dyn RemoteShell,
    workspace: Workspace,
    tail_bytes: u32,
}

impl<'a> CommandHandler<'a> {
    pub fn new(shell: &'a dyn RemoteShell, workspace: Workspace, tail_bytes: u32) -> Self {
        Self {
            shell,
            workspace,
            tail_bytes,
        }
    }

    /// Executes `invocation`, writing operator text to `out` and failure hints
    /// to `err`, and returns the process exit code.
    pub fn run(&self, invocation: &Invocation, out: &mut dyn Write, err: &mut dyn Write) -> i32 {
        let outcome = self.dispatch(invocation, out);
        let _ = out.flush();

        match outcome {
            Ok(code) => code,
            Err(Error::Connection(msg)) => {
                let _ = writeln!(err, "{}", msg);
                EXIT_CONNECTION_FAILED
            }
            Err(Error::Command { exit_code, stderr }) => {
                debug!("{} exited with {}", invocation.command, exit_code);
                let text = diagnose_command_failure(invocation.command, exit_code, &stderr);
                let _ = write!(err, "{}", text);
                if !text.ends_with('\n') {
                    let _ = writeln!(err);
                }
                EXIT_COMMAND_FAILED
            }
            Err(other) => {
                let _ = writeln!(err, "{}", other);
                EXIT_COMMAND_FAILED
            }
        }
    }

    fn dispatch(&self, invocation: &Invocation, out: &mut dyn Write) -> Result<i32> {
        let project = invocation.project.as_str();

        match invocation.command {
            RemoteCommand::Status => {
                let result = self.shell.execute(&self.workspace.status_script(project))?;
                match result.exit_code {
                    0 => Ok(EXIT_APP_RUNNING),
                    1 => Ok(EXIT_APP_NOT_RUNNING),
                    code => Err(Error::Command {
                        exit_code: code,
                        stderr: result.stderr,
                    }),
                }
            }
            RemoteCommand::Execute => {
                // The project slot carries the shell command
                self.checked(project, out)?;
                Ok(EXIT_OK)
            }
            RemoteCommand::Save => {
                let projects_root = invocation.extra.as_deref().ok_or_else(|| {
                    Error::Validation("save needs the projects directory".to_string())
                })?;
                let result =
                    self.shell
                        .upload_project(&self.workspace, Path::new(projects_root), project)?;
                for file in &result.files {
                    writeln!(out, "{} was saved successfully.", file)?;
                }
                Ok(EXIT_OK)
            }
            RemoteCommand::Compile => {
                self.checked(&self.workspace.compile_script(project), out)?;
                writeln!(out, "Build succeeded.")?;
                Ok(EXIT_OK)
            }
            RemoteCommand::Start => {
                let args = invocation.extra.as_deref().unwrap_or("");
                self.checked(&self.workspace.start_script(project, args), out)?;
                writeln!(out, "Application {} started.", project)?;
                Ok(EXIT_OK)
            }
            RemoteCommand::Stop => {
                self.checked(&self.workspace.stop_script(project), out)?;
                writeln!(out, "Application {} stopped.", project)?;
                Ok(EXIT_OK)
            }
            RemoteCommand::ReadOutputOnce => {
                self.checked(
                    &self.workspace.tail_once_script(project, self.tail_bytes),
                    out,
                )?;
                Ok(EXIT_OK)
            }
            RemoteCommand::ReadOutputContinuous => {
                let script = self.workspace.tail_follow_script(project, self.tail_bytes);
                let mut write_failed = false;
                let result = self.shell.execute_streaming(&script, &mut |chunk: &[u8]| {
                    if write_failed {
                        return;
                    }
                    if out.write_all(chunk).and_then(|_| out.flush()).is_err() {
                        warn!("Output consumer went away");
                        write_failed = true;
                    }
                })?;
                if result.is_success() {
                    Ok(EXIT_OK)
                } else {
                    Err(Error::Command {
                        exit_code: result.exit_code,
                        stderr: result.stderr,
                    })
                }
            }
        }
    }

    /// Runs a script, passing its stdout through; a nonzero exit becomes
    /// [`Error::Command`].
    fn checked(&self, script: &str, out: &mut dyn Write) -> Result<()> {
        let result = self.shell.execute(script)?;
        out.write_all(result.stdout.as_bytes())?;
        if result.is_success() {
            Ok(())
        } else {
            Err(Error::Command {
                exit_code: result.exit_code,
                stderr: result.stderr,
            })
        }
    }
}
