//! SFTP-based transfer of project trees to a device.
//!
//! A project is copied by first recreating its directory tree on the device
//! with one shell command, then writing every file over SFTP. The first file
//! that cannot be copied aborts the transfer.

use crate::error::{Error, Result};
use crate::remote::executor::SSHExecutor;
use crate::remote::protocol::Workspace;
use log::{debug, info};
use ssh2::{OpenFlags, OpenType};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Permission bits for copied files: read, write and execute for the owner.
const FILE_MODE: i32 = 0o700;

/// Result of a project transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    /// Copied files, relative to the projects directory
    pub files: Vec<String>,
    /// Size of the transferred data in bytes
    pub bytes_transferred: u64,
}

/// The directories and files of one local project, relative to the projects
/// directory (so every entry starts with the project name).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectTree {
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

impl ProjectTree {
    /// Walks `<projects_root>/<project>`. Entries are sorted so parents come
    /// before their children.
    pub fn collect(projects_root: &Path, project: &str) -> Result<Self> {
        let base = projects_root.join(project);
        if !base.is_dir() {
            return Err(Error::Validation(format!(
                "Project directory {} doesn't exist.",
                base.display()
            )));
        }

        let mut tree = ProjectTree {
            dirs: vec![project.to_string()],
            files: Vec::new(),
        };
        Self::walk(&base, project, &mut tree)?;
        tree.dirs.sort();
        tree.files.sort();
        Ok(tree)
    }

    fn walk(dir: &Path, relative: &str, tree: &mut ProjectTree) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let child = format!("{}/{}", relative, name);
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                tree.dirs.push(child.clone());
                Self::walk(&entry.path(), &child, tree)?;
            } else if file_type.is_file() {
                tree.files.push(child);
            }
        }
        Ok(())
    }
}

/// Copies project trees into a device's workspace over an open session.
pub struct SftpTransfer<'a> {
    executor: &'a SSHExecutor,
    workspace: &'a Workspace,
}

impl<'a> SftpTransfer<'a> {
    pub fn new(executor: &'a SSHExecutor, workspace: &'a Workspace) -> Self {
        Self {
            executor,
            workspace,
        }
    }

    /// Replaces the device's copy of `project` with the local one.
    pub fn upload_project(&self, projects_root: &Path, project: &str) -> Result<TransferResult> {
        let tree = ProjectTree::collect(projects_root, project)?;
        info!(
            "Uploading {} ({} directories, {} files)",
            project,
            tree.dirs.len(),
            tree.files.len()
        );

        self.run_checked(&self.workspace.wipe_script(project))?;
        self.upload_tree(projects_root, &tree)
    }

    /// Creates every directory of `tree`, then copies each file.
    pub fn upload_tree(&self, local_root: &Path, tree: &ProjectTree) -> Result<TransferResult> {
        self.run_checked(&self.workspace.mkdirs_script(&tree.dirs))?;

        let sftp = self
            .executor
            .session()
            .sftp()
            .map_err(|e| Error::Connection(format!("Failed to start SFTP subsystem: {}", e)))?;

        let mut bytes_transferred = 0;
        for file in &tree.files {
            let local = local_root.join(file);
            let remote = PathBuf::from(self.workspace.path(file));
            debug!("Copying {} to {}", local.display(), remote.display());

            let mut contents = Vec::new();
            fs::File::open(&local)
                .and_then(|mut f| f.read_to_end(&mut contents))
                .map_err(|e| {
                    Error::Validation(format!("Cannot read {}: {}", local.display(), e))
                })?;

            let mut handle = sftp
                .open_mode(
                    &remote,
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                    FILE_MODE,
                    OpenType::File,
                )
                .map_err(|e| {
                    Error::Validation(format!(
                        "Cannot open {} on the device: {}",
                        remote.display(),
                        e
                    ))
                })?;

            handle.write_all(&contents).map_err(|e| {
                Error::Validation(format!("Cannot write {} on the device: {}", remote.display(), e))
            })?;

            bytes_transferred += contents.len() as u64;
        }

        Ok(TransferResult {
            files: tree.files.clone(),
            bytes_transferred,
        })
    }

    fn run_checked(&self, script: &str) -> Result<()> {
        let result = self.executor.execute(script)?;
        if !result.is_success() {
            return Err(Error::Command {
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }
        Ok(())
    }
}
