//! Configuration management for pifleet.
//!
//! Two files are involved:
//!
//! - the **settings** file (YAML) holding credentials, timings and paths that
//!   apply to the whole fleet, handled here;
//! - the **testbed** file (line-oriented) listing the devices and the projects
//!   directory, handled by [`testbed`].
//!
//! # Settings File Location
//!
//! - Linux: `~/.config/pifleet/config.yml`
//! - macOS: `~/Library/Application Support/pifleet/config.yml`
//! - Windows: `C:\Users\<User>\AppData\Roaming\pifleet\config.yml`
//!
//! # Example Settings
//!
//! ```yaml
//! credentials:
//!   user: "pi"
//!   password: "raspberry"
//! testbed: "testbed_workspace/testbedkonfiguration.txt"
//! connect_timeout: 5
//! poll_interval_ms: 5000
//! output_tail_bytes: 2048
//! cancel_grace_ms: 2000
//! remote_workspace: "sw_workspace"
//! ```

pub mod testbed;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default location of the testbed file, relative to the working directory.
const DEFAULT_TESTBED: &str = "testbed_workspace/testbedkonfiguration.txt";

/// Default SSH connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT: u64 = 5;

/// Default delay between two status polls of one device
const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// Default number of trailing output bytes fetched by a one-shot read
const DEFAULT_TAIL_BYTES: u32 = 2048;

/// Default grace period before a continuous output follow is killed
const DEFAULT_CANCEL_GRACE_MS: u64 = 2000;

/// Default workspace directory on the devices (relative to the login home)
const DEFAULT_REMOTE_WORKSPACE: &str = "sw_workspace";

/// Environment variables that override the configured credentials.
pub const ENV_USER: &str = "PIFLEET_USER";
pub const ENV_PASSWORD: &str = "PIFLEET_PASSWORD";

/// Fleet-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Login used for every device
    #[serde(default)]
    pub credentials: Credentials,

    /// Path to the testbed file listing devices
    #[serde(default = "default_testbed")]
    pub testbed: PathBuf,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Delay between the end of one status poll and the start of the next
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bytes returned by a one-shot output read
    #[serde(default = "default_tail_bytes")]
    pub output_tail_bytes: u32,

    /// How long a cancelled output follow may take to exit before it is killed
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Workspace directory on the devices
    #[serde(default = "default_remote_workspace")]
    pub remote_workspace: String,

    /// Path to the `pifleet-ssh` executor (defaults to the one next to the running binary)
    #[serde(default)]
    pub executor: Option<PathBuf>,
}

/// Username/password pair handed to the SSH transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            user: "pi".to_string(),
            password: "raspberry".to_string(),
        }
    }
}

fn default_testbed() -> PathBuf {
    PathBuf::from(DEFAULT_TESTBED)
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_tail_bytes() -> u32 {
    DEFAULT_TAIL_BYTES
}

fn default_cancel_grace_ms() -> u64 {
    DEFAULT_CANCEL_GRACE_MS
}

fn default_remote_workspace() -> String {
    DEFAULT_REMOTE_WORKSPACE.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            testbed: default_testbed(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            output_tail_bytes: DEFAULT_TAIL_BYTES,
            cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
            remote_workspace: default_remote_workspace(),
            executor: None,
        }
    }
}

impl Settings {
    /// Returns the default settings file path for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("pifleet").join("config.yml"))
    }

    /// Loads settings from the default location.
    ///
    /// Returns `Ok(Settings::default())` if no settings file exists.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Settings::default()),
        }
    }

    /// Loads settings from a specific file path.
    ///
    /// Returns `Ok(Settings::default())` if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Settings::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read settings file {}: {}\n\n\
                 Suggestions:\n\
                 • Check file permissions: ls -la {}\n\
                 • Recreate it with: pifleet settings init --force",
                path.display(),
                e,
                path.display()
            ))
        })?;

        serde_yaml::from_str(&contents).map_err(|e| {
            Error::Config(format!(
                "Failed to parse settings file {}: {}\n\n\
                 Suggestions:\n\
                 • Check YAML syntax and indentation (spaces, not tabs)\n\
                 • Backup and recreate: mv {} {}.bak && pifleet settings init",
                path.display(),
                e,
                path.display(),
                path.display()
            ))
        })
    }

    /// Saves settings to a specific file path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_yaml::to_string(self)?;
        fs::write(path, contents)?;

        Ok(())
    }

    /// Applies `PIFLEET_USER` / `PIFLEET_PASSWORD` overrides from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(user) = std::env::var(ENV_USER) {
            self.credentials.user = user;
        }
        if let Ok(password) = std::env::var(ENV_PASSWORD) {
            self.credentials.password = password;
        }
        self
    }

    /// Builder method to set the testbed file.
    pub fn with_testbed(mut self, path: PathBuf) -> Self {
        self.testbed = path;
        self
    }

    /// Builder method to set the status poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Builder method to set the cancellation grace period.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Builder method to set the executor path.
    pub fn with_executor(mut self, path: PathBuf) -> Self {
        self.executor = Some(path);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Resolves the executor binary: the configured path, or `pifleet-ssh`
    /// next to the current executable, or plain `pifleet-ssh` from `PATH`.
    pub fn executor_path(&self) -> PathBuf {
        if let Some(path) = &self.executor {
            return path.clone();
        }

        let name = format!("pifleet-ssh{}", std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
            .filter(|candidate| candidate.exists())
            .unwrap_or_else(|| PathBuf::from(name))
    }
}
