pub mod check;
pub mod run;
pub mod settings;

use anyhow::Result;
use std::path::Path;

use pifleet::config::Settings;

/// Loads settings from `path`, or from the per-user location.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    Ok(settings.with_env_overrides())
}
