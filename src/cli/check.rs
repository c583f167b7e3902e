//! CLI command that validates the testbed without contacting any device.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use pifleet::config::testbed::Testbed;
use pifleet::fleet::{unassigned, validate_devices};
use pifleet::project::ProjectCatalog;

#[derive(Args)]
#[command(about = "Validate the testbed file and list devices and projects")]
pub struct CheckCommand {
    /// Testbed file (overrides the settings)
    #[arg(long)]
    pub testbed: Option<PathBuf>,

    /// Settings file (defaults to the per-user location)
    #[arg(long)]
    pub settings: Option<PathBuf>,
}

impl CheckCommand {
    pub fn execute(&self) -> Result<()> {
        let settings = super::load_settings(self.settings.as_deref())?;
        let path = self.testbed.clone().unwrap_or(settings.testbed);

        let testbed = Testbed::load(&path)?;
        let catalog = ProjectCatalog::discover(&testbed.projects_path)?;
        let (devices, warnings) = validate_devices(testbed.devices);

        println!("Testbed: {}", path.display());
        println!("Projects in {}:", testbed.projects_path.display());
        if catalog.is_empty() {
            println!("  (none)");
        }
        for name in catalog.names() {
            let template = catalog
                .get(name)
                .map(|p| p.argv_template.as_str())
                .unwrap_or_default();
            if template.is_empty() {
                println!("  {}", name);
            } else {
                println!("  {}  argv: {}", name, template);
            }
        }

        println!();
        println!("Devices:");
        if devices.is_empty() {
            println!("  (none)");
        }
        for device in &devices {
            let argv = catalog
                .get(&device.project)
                .map(|p| p.resolve_args(&device.args))
                .unwrap_or_default();
            println!(
                "  {} | {} | {} | {}",
                device.name,
                device.address,
                if device.project.is_empty() {
                    "(unassigned)"
                } else {
                    &device.project
                },
                argv
            );
        }

        let unassigned = unassigned(&devices, &catalog);
        if !warnings.is_empty() || !unassigned.is_empty() {
            println!();
            println!("Warnings:");
            for warning in &warnings {
                println!("  ⚠ {}", warning);
            }
            for name in unassigned {
                println!("  ⚠ {} has no valid project assigned.", name);
            }
        }

        Ok(())
    }
}
