//! Reading and writing the line-oriented testbed file.
//!
//! ```text
//! # comment
//! projectsPath=testbed_workspace/projects
//!
//! [pi-01]
//! address=192.168.0.11
//! project=Blink
//! args=delay:500,pin:17
//! ```
//!
//! The file is always rewritten as a whole: `projectsPath` first, then one
//! section per device in fleet order.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// One `[name]` section of the testbed file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceEntry {
    pub name: String,
    pub address: String,
    pub project: String,
    pub args: BTreeMap<String, String>,
}

impl DeviceEntry {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_arg(mut self, token: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(token.into(), value.into());
        self
    }
}

/// Parsed contents of the testbed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Testbed {
    pub projects_path: PathBuf,
    pub devices: Vec<DeviceEntry>,
}

impl Testbed {
    /// Reads and parses the testbed file. A missing file is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot open file {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
    }

    /// Parses testbed text.
    ///
    /// Unknown keys and malformed lines are ignored; the only hard failure is
    /// a missing or empty `projectsPath`.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut projects_path = String::new();
        let mut devices = Vec::new();
        let mut current: Option<DeviceEntry> = None;

        for raw in contents.lines() {
            let line = raw.trim();

            if line.starts_with('#') {
                continue;
            }

            if line.is_empty() {
                // A blank line closes the open section
                if let Some(entry) = current.take() {
                    devices.push(entry);
                }
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                if let Some(entry) = current.take() {
                    devices.push(entry);
                }
                current = Some(DeviceEntry {
                    name: line[1..line.len() - 1].to_string(),
                    ..Default::default()
                });
                continue;
            }

            let Some((key, value)) = split_property(line) else {
                continue;
            };

            match current.as_mut() {
                Some(entry) => match key {
                    "address" => entry.address = value.to_string(),
                    "project" => entry.project = value.to_string(),
                    "args" => entry.args = parse_args(value),
                    _ => {}
                },
                None => {
                    if key == "projectsPath" {
                        projects_path = value.to_string();
                    }
                }
            }
        }

        if let Some(entry) = current.take() {
            devices.push(entry);
        }

        if projects_path.is_empty() {
            return Err(Error::Config("No project directory was given.".to_string()));
        }

        Ok(Self {
            projects_path: PathBuf::from(projects_path),
            devices,
        })
    }

    /// Renders the testbed in its canonical form.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "projectsPath={}", self.projects_path.display());

        for device in &self.devices {
            let args = device
                .args
                .iter()
                .map(|(token, value)| format!("{}:{}", token, value))
                .collect::<Vec<_>>()
                .join(",");

            let _ = write!(
                out,
                "\n[{}]\naddress={}\nproject={}\nargs={}\n",
                device.name, device.address, device.project, args
            );
        }

        out
    }

    /// Rewrites the testbed file completely.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render()).map_err(|e| {
            Error::Config(format!(
                "The current configuration wasn't saved because {} couldn't be written: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Splits `key=value`; lines with zero or several `=` are rejected.
fn split_property(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.split('=');
    let key = parts.next()?;
    let value = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((key.trim(), value.trim()))
}

/// Parses `tok:val,tok:val`. Pairs without exactly one `:` are dropped.
fn parse_args(value: &str) -> BTreeMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| {
            let mut parts = pair.split(':');
            let token = parts.next()?.trim();
            let val = parts.next()?.trim();
            if parts.next().is_some() || token.is_empty() {
                return None;
            }
            Some((token.to_string(), val.to_string()))
        })
        .collect()
}
