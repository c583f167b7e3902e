//! The command vocabulary shared by the orchestrator and `pifleet-ssh`.
//!
//! The executor is invoked as
//!
//! ```text
//! pifleet-ssh <address> <command> <project> [extra]
//! ```
//!
//! and reports through its exit code only. The orchestrator never parses
//! stdout to decide success; stdout is operator-facing text, stderr carries
//! the failure hint.

use std::fmt;
use std::str::FromStr;

use crate::device::state::Observation;
use crate::error::Error;

pub const EXIT_OK: i32 = 0;
/// `status`: the project's application is running.
pub const EXIT_APP_RUNNING: i32 = 1;
/// `status`: the device is reachable, the application is not running.
pub const EXIT_APP_NOT_RUNNING: i32 = 2;
/// A well-formed remote command failed; stderr holds the hint.
pub const EXIT_COMMAND_FAILED: i32 = 254;
/// Connection/authentication failure, or a malformed invocation.
pub const EXIT_CONNECTION_FAILED: i32 = 255;

/// Name of the per-run output file inside the project's `Debug` directory.
pub const OUTPUT_FILE: &str = "output.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCommand {
    Status,
    Execute,
    Save,
    Compile,
    Start,
    Stop,
    ReadOutputOnce,
    ReadOutputContinuous,
}

impl RemoteCommand {
    pub const ALL: [RemoteCommand; 8] = [
        RemoteCommand::Status,
        RemoteCommand::Execute,
        RemoteCommand::Save,
        RemoteCommand::Compile,
        RemoteCommand::Start,
        RemoteCommand::Stop,
        RemoteCommand::ReadOutputOnce,
        RemoteCommand::ReadOutputContinuous,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteCommand::Status => "status",
            RemoteCommand::Execute => "execute",
            RemoteCommand::Save => "save",
            RemoteCommand::Compile => "compile",
            RemoteCommand::Start => "start",
            RemoteCommand::Stop => "stop",
            RemoteCommand::ReadOutputOnce => "readOutput_once",
            RemoteCommand::ReadOutputContinuous => "readOutput_cont",
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RemoteCommand::ALL
            .into_iter()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("Unknown command: {}", s)))
    }
}

/// One executor call: `<address> <command> <project> [extra]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub address: String,
    pub command: RemoteCommand,
    pub project: String,
    pub extra: Option<String>,
}

impl Invocation {
    pub fn new(address: impl Into<String>, command: RemoteCommand, project: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            command,
            project: project.into(),
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }

    /// Positional arguments for the executor process.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            self.address.clone(),
            self.command.as_str().to_string(),
            self.project.clone(),
        ];
        if let Some(extra) = &self.extra {
            args.push(extra.clone());
        }
        args
    }
}

/// Maps the exit code of a `status` call to an observation.
///
/// `None` means the executor could not be started or was killed.
pub fn classify_status(exit_code: Option<i32>, stderr: &str) -> Observation {
    match exit_code {
        Some(EXIT_APP_RUNNING) => Observation::AppRunning,
        Some(EXIT_APP_NOT_RUNNING) => Observation::Online,
        Some(_) => Observation::Offline(stderr.trim().to_string()),
        None if stderr.trim().is_empty() => {
            Observation::Offline("Executor terminated without an exit code".to_string())
        }
        None => Observation::Offline(stderr.trim().to_string()),
    }
}

/// Quotes a string for a POSIX shell.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Layout of the workspace on a device and the shell scripts run there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: String,
}

impl Workspace {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// `<root>/<relative>`
    pub fn path(&self, relative: &str) -> String {
        format!("{}/{}", self.root, relative)
    }

    pub fn output_file(&self, project: &str) -> String {
        format!("{}/{}/Debug/{}", self.root, project, OUTPUT_FILE)
    }

    pub fn status_script(&self, project: &str) -> String {
        format!(
            "pidof {} > /dev/null && echo 'Application is running.' \
             || {{ >&2 echo 'Application is not running.'; exit 1; }}",
            sh_quote(project)
        )
    }

    /// Removes the project's previous copy from the workspace.
    pub fn wipe_script(&self, project: &str) -> String {
        format!(
            "mkdir -p {root} && rm -rf {dir}",
            root = sh_quote(&self.root),
            dir = sh_quote(&self.path(project))
        )
    }

    /// Creates the given directories (relative to the workspace root).
    pub fn mkdirs_script<S: AsRef<str>>(&self, dirs: &[S]) -> String {
        let mut cmd = format!("mkdir -p {}", sh_quote(&self.root));
        for dir in dirs {
            cmd.push(' ');
            cmd.push_str(&sh_quote(&self.path(dir.as_ref())));
        }
        cmd
    }

    pub fn compile_script(&self, project: &str) -> String {
        format!(
            "cd {dir} || {{ >&2 echo 'Have you saved the project before?'; exit 1; }}; \
             mkdir -p Debug || exit 1; \
             test -f makefile || {{ >&2 echo 'Error: The project is missing a makefile'; exit 1; }}; \
             make -s || {{ >&2 echo 'Build error'; exit 1; }}; \
             : > Debug/{output}",
            dir = sh_quote(&self.path(project)),
            output = OUTPUT_FILE
        )
    }

    /// Launches the compiled binary detached. Its output goes to the output
    /// file, followed by an exit-code footer once it terminates.
    pub fn start_script(&self, project: &str, args: &str) -> String {
        let run = format!(
            "./{bin} {args} &> {output}; \
             printf '\\nThe Process exited with Code %s\\n' \"$?\" >> {output}",
            bin = sh_quote(project),
            args = args,
            output = OUTPUT_FILE
        );

        format!(
            "cd {dir} || {{ >&2 echo 'Have you saved the project before?'; exit 1; }}; \
             cd Debug || {{ >&2 echo 'Have you compiled the project before?'; exit 1; }}; \
             test -f {bin} || {{ >&2 printf '%s\\n' \
             {missing} \
             'Is the final target of the makefile called {project}?' \
             'Was the compilation of the project successful?'; exit 1; }}; \
             nohup bash -c {run} > /dev/null 2>&1 &",
            dir = sh_quote(&self.path(project)),
            bin = sh_quote(project),
            missing = sh_quote(&format!("The binary {} of the project is missing", project)),
            project = project.replace('\'', ""),
            run = sh_quote(&run)
        )
    }

    pub fn stop_script(&self, project: &str) -> String {
        format!(
            "killall {} || {{ >&2 echo 'Are you sure that the Application is running?'; exit 1; }}",
            sh_quote(project)
        )
    }

    /// Last `bytes` bytes of the output file; succeeds even if it is absent.
    pub fn tail_once_script(&self, project: &str, bytes: u32) -> String {
        format!(
            "tail -c {} {} 2> /dev/null; exit 0",
            bytes,
            sh_quote(&self.output_file(project))
        )
    }

    /// Follows the output file across truncation and re-creation.
    pub fn tail_follow_script(&self, project: &str, bytes: u32) -> String {
        format!(
            "tail -F -c {} {}",
            bytes,
            sh_quote(&self.output_file(project))
        )
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new("sw_workspace")
    }
}
