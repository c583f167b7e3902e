//! The fleet: every device agent plus the bulk-dispatch logic.
//!
//! The fleet is built from the testbed file and the projects directory. Both
//! are read again on refresh, and the testbed is rewritten whenever the
//! operator changes a device's project or arguments.

pub mod batch;

use log::{info, warn};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::config::testbed::{DeviceEntry, Testbed};
use crate::config::Settings;
use crate::device::agent::AgentContext;
use crate::device::{DeviceAgent, DeviceSnapshot, Operation, RejectReason, RemoteRunner};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::project::ProjectCatalog;
use batch::BatchTracker;

/// Warnings collected while building the fleet. None of them is fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub warnings: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for warning in &self.warnings {
            writeln!(f, "{}", warning)?;
        }
        Ok(())
    }
}

/// A device left out of a dispatch, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub device: String,
    pub project: String,
    pub operation: Operation,
    pub reason: RejectReason,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let device = &self.device;
        match self.reason {
            RejectReason::UnknownDevice => write!(f, "Unknown device: {}.", device),
            RejectReason::NoProject => write!(f, "No valid project is assigned to {}.", device),
            RejectReason::NotConnected => write!(f, "{} is not connected.", device),
            RejectReason::StillChecking => write!(f, "Still checking the status of {}.", device),
            RejectReason::AppRunning if self.operation == Operation::Start => write!(
                f,
                "Application {} is already running on {}.",
                self.project, device
            ),
            RejectReason::AppRunning => write!(f, "An application is running on {}.", device),
            RejectReason::NotRunning => write!(
                f,
                "Application {} is not running on {}.",
                self.project, device
            ),
        }
    }
}

/// Outcome of one bulk dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub operation: Operation,
    pub dispatched: Vec<String>,
    pub rejected: Vec<Rejection>,
}

impl DispatchReport {
    fn new(operation: Operation) -> Self {
        Self {
            operation,
            dispatched: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rejection in &self.rejected {
            writeln!(f, "{}", rejection)?;
        }
        Ok(())
    }
}

/// Drops entries that cannot become devices, keeping fleet order.
///
/// Entries without a name are skipped silently; an empty address or a name or
/// address that is already taken produces a warning.
pub fn validate_devices(entries: Vec<DeviceEntry>) -> (Vec<DeviceEntry>, Vec<String>) {
    let mut accepted: Vec<DeviceEntry> = Vec::new();
    let mut warnings = Vec::new();

    for entry in entries {
        if entry.name.is_empty() {
            continue;
        }
        if entry.address.is_empty() {
            warnings.push(format!("No address was set for Client {}.", entry.name));
            continue;
        }
        if accepted.iter().any(|d| d.name == entry.name) {
            warnings.push(format!("Duplicate name: {}.", entry.name));
            continue;
        }
        if let Some(other) = accepted.iter().find(|d| d.address == entry.address) {
            warnings.push(format!(
                "Client {} has the same address as Client {} ({}).",
                entry.name, other.name, entry.address
            ));
            continue;
        }
        accepted.push(entry);
    }

    (accepted, warnings)
}

/// Devices whose project is not a discovered project.
pub fn unassigned<'a>(entries: &'a [DeviceEntry], catalog: &ProjectCatalog) -> Vec<&'a str> {
    entries
        .iter()
        .filter(|e| !catalog.contains(&e.project))
        .map(|e| e.name.as_str())
        .collect()
}

pub struct Fleet {
    testbed_path: PathBuf,
    projects_path: PathBuf,
    catalog: ProjectCatalog,
    entries: Vec<DeviceEntry>,
    agents: Vec<DeviceAgent>,
    index: HashMap<String, usize>,
    batch: Arc<BatchTracker>,
    settings: Settings,
    runner: Arc<dyn RemoteRunner>,
    events: EventBus,
}

impl Fleet {
    /// Reads the testbed and the projects directory and starts one agent per
    /// valid device. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the testbed file cannot be read, names no
    /// projects directory, or that directory does not exist.
    pub fn load(
        settings: Settings,
        runner: Arc<dyn RemoteRunner>,
        events: EventBus,
    ) -> Result<(Self, LoadReport)> {
        let batch = Arc::new(BatchTracker::new(events.clone()));
        let mut fleet = Self {
            testbed_path: settings.testbed.clone(),
            projects_path: PathBuf::new(),
            catalog: ProjectCatalog::default(),
            entries: Vec::new(),
            agents: Vec::new(),
            index: HashMap::new(),
            batch,
            settings,
            runner,
            events,
        };
        let report = fleet.populate()?;
        Ok((fleet, report))
    }

    fn populate(&mut self) -> Result<LoadReport> {
        let testbed = Testbed::load(&self.testbed_path)?;
        let catalog = ProjectCatalog::discover(&testbed.projects_path)?;
        let (entries, warnings) = validate_devices(testbed.devices);

        let ctx = AgentContext {
            runner: self.runner.clone(),
            events: self.events.clone(),
            batch: self.batch.clone(),
            projects_path: testbed.projects_path.clone(),
            poll_interval: self.settings.poll_interval(),
            cancel_grace: self.settings.cancel_grace(),
        };

        self.agents = entries
            .iter()
            .map(|entry| DeviceAgent::spawn(entry, catalog.get(&entry.project), ctx.clone()))
            .collect();
        self.index = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.name.clone(), i))
            .collect();

        for name in unassigned(&entries, &catalog) {
            warn!("Device {} has no valid project assigned", name);
        }
        info!(
            "Fleet loaded: {} device(s), {} project(s)",
            entries.len(),
            catalog.len()
        );

        self.entries = entries;
        self.catalog = catalog;
        self.projects_path = testbed.projects_path;

        Ok(LoadReport { warnings })
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceAgent> {
        self.agents.iter()
    }

    pub fn device(&self, name: &str) -> Option<&DeviceAgent> {
        self.index.get(name).map(|&i| &self.agents[i])
    }

    pub fn snapshot(&self, name: &str) -> Result<DeviceSnapshot> {
        self.device(name)
            .map(DeviceAgent::snapshot)
            .ok_or_else(|| Error::UnknownDevice(name.to_string()))
    }

    pub fn catalog(&self) -> &ProjectCatalog {
        &self.catalog
    }

    pub fn projects_path(&self) -> &std::path::Path {
        &self.projects_path
    }

    pub fn is_busy(&self) -> bool {
        self.batch.is_busy()
    }

    /// Validates `operation` against each named device and dispatches it to
    /// every device that passes.
    ///
    /// # Errors
    ///
    /// [`Error::NothingSelected`] for an empty selection, [`Error::Busy`]
    /// while a batch is in flight. Per-device problems are not errors; they
    /// are listed in the report.
    pub fn dispatch<S: AsRef<str>>(&self, operation: Operation, names: &[S]) -> Result<DispatchReport> {
        if names.is_empty() {
            return Err(Error::NothingSelected);
        }
        if self.batch.is_busy() {
            return Err(Error::Busy(self.batch.outstanding()));
        }

        let mut report = DispatchReport::new(operation);
        let mut valid = Vec::new();

        for name in names {
            let name = name.as_ref();
            let Some(&i) = self.index.get(name) else {
                report.rejected.push(Rejection {
                    device: name.to_string(),
                    project: String::new(),
                    operation,
                    reason: RejectReason::UnknownDevice,
                });
                continue;
            };

            let snapshot = self.agents[i].snapshot();
            let reason = operation.check(snapshot.status).or_else(|| {
                (!snapshot.project_valid).then_some(RejectReason::NoProject)
            });

            match reason {
                Some(reason) => report.rejected.push(Rejection {
                    device: name.to_string(),
                    project: snapshot.project,
                    operation,
                    reason,
                }),
                None if valid.contains(&i) => {}
                None => valid.push(i),
            }
        }

        if valid.is_empty() {
            return Ok(report);
        }

        self.batch.begin(operation, valid.len())?;
        for i in valid {
            let agent = &self.agents[i];
            if agent.dispatch(operation) {
                report.dispatched.push(agent.name().to_string());
            } else {
                warn!("Device {} is shutting down, {} not sent", agent.name(), operation);
                self.batch.settle();
            }
        }

        info!(
            "{} dispatched to {} device(s), {} rejected",
            operation,
            report.dispatched.len(),
            report.rejected.len()
        );
        Ok(report)
    }

    /// Assigns a discovered project to a device and rewrites the testbed.
    pub fn assign(&mut self, device: &str, project: &str) -> Result<()> {
        let i = self.position(device)?;
        let found = self.catalog.get(project).ok_or_else(|| {
            Error::Validation(format!("Project {} doesn't exist.", project))
        })?;

        self.agents[i].assign(project, Some(found));
        self.entries[i].project = project.to_string();
        self.persist()
    }

    /// Sets one argument of a device (an empty value removes it) and rewrites
    /// the testbed.
    pub fn set_argument(&mut self, device: &str, token: &str, value: &str) -> Result<()> {
        let i = self.position(device)?;
        if token.is_empty() || token.contains([':', ',', '=']) {
            return Err(Error::Validation(format!("Invalid argument name: {:?}", token)));
        }
        if value.contains([',', '=']) {
            return Err(Error::Validation(format!("Invalid argument value: {:?}", value)));
        }

        let args = &mut self.entries[i].args;
        if value.is_empty() {
            args.remove(token);
        } else {
            args.insert(token.to_string(), value.to_string());
        }

        self.agents[i].set_args(args.clone());
        self.persist()
    }

    fn position(&self, device: &str) -> Result<usize> {
        self.index
            .get(device)
            .copied()
            .ok_or_else(|| Error::UnknownDevice(device.to_string()))
    }

    fn persist(&self) -> Result<()> {
        Testbed {
            projects_path: self.projects_path.clone(),
            devices: self.entries.clone(),
        }
        .save(&self.testbed_path)
    }

    /// Tears every device down and rebuilds the fleet from disk.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] while a batch is in flight; configuration errors as
    /// for [`Fleet::load`], in which case the fleet is left empty.
    pub async fn refresh(&mut self) -> Result<LoadReport> {
        self.stop().await?;
        self.reload()
    }

    /// First half of a refresh: stops every device and empties the fleet.
    ///
    /// When this returns, every event of the stopped devices is already
    /// queued on the bus, so a consumer can discard them before
    /// [`Fleet::reload`] starts new devices.
    pub async fn stop(&mut self) -> Result<()> {
        if self.batch.is_busy() {
            return Err(Error::Busy(self.batch.outstanding()));
        }

        info!("Stopping fleet for a refresh");
        self.stop_agents().await;
        self.entries.clear();
        self.index.clear();
        Ok(())
    }

    /// Second half of a refresh: reads the testbed and projects again and
    /// starts the devices. Must be called inside a tokio runtime.
    pub fn reload(&mut self) -> Result<LoadReport> {
        self.populate()
    }

    /// Stops every device, waiting for their lanes.
    pub async fn shutdown(mut self) {
        self.stop_agents().await;
    }

    async fn stop_agents(&mut self) {
        let mut stopping = JoinSet::new();
        for agent in self.agents.drain(..) {
            stopping.spawn(agent.shutdown());
        }
        while let Some(result) = stopping.join_next().await {
            if let Err(e) = result {
                warn!("Device shutdown failed: {}", e);
            }
        }
        self.batch.reset();
    }
}
