//! Project discovery and argument templates.
//!
//! A project is an immediate subdirectory of the projects directory that
//! contains a `makefile`. Its argument template is the `argv=` line of the
//! optional `config.txt` inside it, e.g. `argv=--delay %delay% --pin %pin%`.

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// File whose presence marks a directory as a buildable project.
pub const BUILD_DESCRIPTOR: &str = "makefile";

/// Per-project file holding the argument template.
pub const PROJECT_CONFIG: &str = "config.txt";

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%(\w+)%").expect("placeholder pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub path: PathBuf,
    /// Raw template, may contain `%token%` placeholders
    pub argv_template: String,
}

impl Project {
    /// Resolves the template for one device's argument map.
    pub fn resolve_args(&self, args: &BTreeMap<String, String>) -> String {
        resolve_template(&self.argv_template, args)
    }
}

/// Replaces every `%token%` with `args[token]`, or with nothing if the token
/// is not mapped. Matches are taken left to right without overlap.
pub fn resolve_template(template: &str, args: &BTreeMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            args.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// The set of projects found under one projects directory.
#[derive(Debug, Clone, Default)]
pub struct ProjectCatalog {
    root: PathBuf,
    projects: BTreeMap<String, Project>,
}

impl ProjectCatalog {
    /// Scans `root` for projects. A missing directory is a configuration error.
    pub fn discover(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "Directory {} doesn't exist.",
                root.display()
            )));
        }

        let mut projects = BTreeMap::new();

        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || !path.join(BUILD_DESCRIPTOR).is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            let argv_template = read_argv_template(&path);
            debug!("Discovered project {} (argv: {:?})", name, argv_template);

            projects.insert(
                name.clone(),
                Project {
                    name,
                    path,
                    argv_template,
                },
            );
        }

        Ok(Self {
            root: root.to_path_buf(),
            projects,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, name: &str) -> Option<&Project> {
        self.projects.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.projects.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.projects.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

/// Reads the `argv=` line of a project's `config.txt`; empty if absent.
fn read_argv_template(project_dir: &Path) -> String {
    let path = project_dir.join(PROJECT_CONFIG);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) => {
            if path.exists() {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            return String::new();
        }
    };

    let mut template = String::new();
    for line in contents.lines() {
        if line.starts_with('#') {
            continue;
        }
        let mut parts = line.split('=');
        if let (Some("argv"), Some(value), None) = (parts.next(), parts.next(), parts.next()) {
            template = value.to_string();
        }
    }
    template
}
