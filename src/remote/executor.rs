//! SSH-based remote command execution.
//!
//! This module provides the `SSHExecutor`, an authenticated session to one
//! device that runs commands and captures their exit codes and output, with
//! support for streaming output.

use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::remote::diagnostics::diagnose_ssh_error;
use log::{debug, info};
use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Default SSH port, used when the address carries none.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Result of executing a remote command.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Exit code (0 for success)
    pub exit_code: i32,
}

impl ExecutionResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An authenticated SSH session to one device.
pub struct SSHExecutor {
    session: Session,
    host: String,
    port: u16,
}

/// Splits `host[:port]`. Bare IPv6 addresses are taken as host only.
pub fn split_address(address: &str) -> (String, u16) {
    if let Some((host, port)) = address.rsplit_once(':') {
        if !host.contains(':') {
            if let Ok(port) = port.parse() {
                return (host.to_string(), port);
            }
        }
    }
    (address.to_string(), DEFAULT_SSH_PORT)
}

impl SSHExecutor {
    /// Connects and authenticates with a username/password pair.
    ///
    /// `timeout` bounds the TCP connect, the handshake and authentication.
    /// Once connected the session has no timeout, so long-running commands
    /// and output follows may block as long as they need.
    ///
    /// # Errors
    ///
    /// Every failure (resolution, TCP, handshake, authentication) is reported
    /// as [`Error::Connection`] carrying troubleshooting hints.
    pub fn connect(address: &str, credentials: &Credentials, timeout: Duration) -> Result<Self> {
        let (host, port) = split_address(address);
        info!("Connecting to {}:{}", host, port);

        Self::connect_once(&host, port, credentials, timeout)
            .map(|session| Self {
                session,
                host: host.clone(),
                port,
            })
            .map_err(|e| Error::Connection(diagnose_ssh_error(&e, &host, port)))
    }

    fn connect_once(
        host: &str,
        port: u16,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Session> {
        let addr = format!("{}:{}", host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Connection(format!("Failed to resolve host '{}': {}", host, e)))?
            .next()
            .ok_or_else(|| Error::Connection(format!("No addresses found for host '{}'", host)))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            Error::Connection(format!("Failed to connect to {}: {}", host, e))
        })?;

        let mut sess = Session::new()
            .map_err(|e| Error::Connection(format!("Failed to create SSH session: {}", e)))?;

        sess.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        sess.set_tcp_stream(tcp);
        sess.handshake()
            .map_err(|e| Error::Connection(format!("SSH handshake failed: {}", e)))?;

        debug!("Authenticating as user: {}", credentials.user);
        sess.userauth_password(&credentials.user, &credentials.password)
            .map_err(|e| {
                Error::Connection(format!(
                    "SSH authentication failed for user {}: {}",
                    credentials.user, e
                ))
            })?;

        if !sess.authenticated() {
            return Err(Error::Connection(
                "SSH connection established but not authenticated".to_string(),
            ));
        }

        // Blocking commands must not time out after the connect phase
        sess.set_timeout(0);

        debug!("SSH connection to {}:{} established", host, port);
        Ok(sess)
    }

    /// Closes the session. Errors are logged, never returned.
    pub fn disconnect(self) {
        if let Err(e) = self.session.disconnect(None, "pifleet done", None) {
            debug!("Disconnect from {}:{} failed: {}", self.host, self.port, e);
        }
    }

    /// The underlying session, for SFTP transfers.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Executes a command on the remote host.
    ///
    /// # Returns
    ///
    /// An `ExecutionResult` containing stdout, stderr, and exit code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the channel cannot be opened or the
    /// session drops while the command runs.
    pub fn execute(&self, command: &str) -> Result<ExecutionResult> {
        debug!("Executing remote command: {}", command);

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| Error::Connection(format!("Failed to open channel: {}", e)))?;

        channel
            .exec(command)
            .map_err(|e| Error::Connection(format!("Failed to execute command: {}", e)))?;

        let mut stdout = Vec::new();
        channel
            .read_to_end(&mut stdout)
            .map_err(|e| Error::Connection(format!("Failed to read stdout: {}", e)))?;

        let mut stderr = Vec::new();
        channel
            .stderr()
            .read_to_end(&mut stderr)
            .map_err(|e| Error::Connection(format!("Failed to read stderr: {}", e)))?;

        channel
            .wait_close()
            .map_err(|e| Error::Connection(format!("Failed to close channel: {}", e)))?;

        let exit_code = channel
            .exit_status()
            .map_err(|e| Error::Connection(format!("Failed to get exit status: {}", e)))?;

        debug!("Command exit code: {}", exit_code);

        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    /// Executes a command with streaming output.
    ///
    /// Each chunk of stdout is handed to `output_callback` as soon as it
    /// arrives. The returned result carries stderr and the exit code; its
    /// stdout is empty since it was already delivered.
    pub fn execute_streaming<F>(&self, command: &str, mut output_callback: F) -> Result<ExecutionResult>
    where
        F: FnMut(&[u8]),
    {
        debug!("Executing remote command with streaming: {}", command);

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| Error::Connection(format!("Failed to open channel: {}", e)))?;

        channel
            .exec(command)
            .map_err(|e| Error::Connection(format!("Failed to execute command: {}", e)))?;

        let mut buffer = vec![0u8; 4096];

        loop {
            match channel.read(&mut buffer) {
                Ok(0) => break, // EOF
                Ok(n) => output_callback(&buffer[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(Error::Connection(format!("Connection lost: {}", e)));
                }
            }
        }

        let mut stderr = Vec::new();
        channel
            .stderr()
            .read_to_end(&mut stderr)
            .map_err(|e| Error::Connection(format!("Failed to read stderr: {}", e)))?;

        channel
            .wait_close()
            .map_err(|e| Error::Connection(format!("Failed to close channel: {}", e)))?;

        let exit_code = channel
            .exit_status()
            .map_err(|e| Error::Connection(format!("Failed to get exit status: {}", e)))?;

        debug!("Command exit code: {}", exit_code);

        Ok(ExecutionResult {
            stdout: String::new(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}
