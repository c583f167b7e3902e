//! CLI command for managing pifleet settings.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use pifleet::config::Settings;
use pifleet::remote::SSHExecutor;

#[derive(Args)]
#[command(about = "Manage pifleet settings")]
pub struct SettingsCommand {
    /// Settings file (defaults to the per-user location)
    #[arg(long, global = true)]
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub action: SettingsAction,
}

#[derive(Subcommand)]
pub enum SettingsAction {
    /// Show the effective settings
    Show,

    /// Show the settings file path
    Path,

    /// Write a settings file with the default values
    Init {
        /// Overwrite an existing settings file
        #[arg(long)]
        force: bool,
    },

    /// Check that the configured credentials open an SSH session
    Validate {
        /// Device address (host or host:port)
        address: String,
    },
}

impl SettingsCommand {
    pub fn execute(&self) -> Result<()> {
        match &self.action {
            SettingsAction::Show => self.show(),
            SettingsAction::Path => self.show_path(),
            SettingsAction::Init { force } => self.init(*force),
            SettingsAction::Validate { address } => self.validate(address),
        }
    }

    fn path(&self) -> Result<PathBuf> {
        match &self.file {
            Some(path) => Ok(path.clone()),
            None => Settings::default_path()
                .ok_or_else(|| anyhow::anyhow!("Could not determine configuration directory")),
        }
    }

    fn show(&self) -> Result<()> {
        let settings = super::load_settings(self.file.as_deref())?;
        let yaml = serde_yaml::to_string(&settings)?;
        println!("{}", yaml);
        Ok(())
    }

    fn show_path(&self) -> Result<()> {
        let path = self.path()?;
        println!("Settings file path: {}", path.display());
        if path.exists() {
            println!("Status: File exists");
        } else {
            println!("Status: File does not exist (defaults are used)");
        }
        Ok(())
    }

    fn init(&self, force: bool) -> Result<()> {
        let path = self.path()?;

        if path.exists() && !force {
            println!("Settings file already exists at: {}", path.display());
            println!("Use --force to overwrite");
            return Ok(());
        }

        Settings::default()
            .save_to(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        println!("Created settings file at: {}", path.display());
        println!();
        println!("Edit the credentials and the testbed path, then check the fleet with:");
        println!("  pifleet check");
        Ok(())
    }

    fn validate(&self, address: &str) -> Result<()> {
        let settings = super::load_settings(self.file.as_deref())?;

        println!("Connecting to {} as {}...", address, settings.credentials.user);
        let executor =
            SSHExecutor::connect(address, &settings.credentials, settings.connect_timeout())?;

        let result = executor.execute("uname -a")?;
        executor.disconnect();

        if !result.is_success() {
            anyhow::bail!(
                "Connected, but a test command failed (exit code {}): {}",
                result.exit_code,
                result.stderr.trim()
            );
        }

        println!("✓ Connection OK: {}", result.stdout.trim());
        Ok(())
    }
}
