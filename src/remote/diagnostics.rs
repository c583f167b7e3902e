//! Diagnostic utilities for remote execution failures.
//!
//! These turn raw transport errors and failed remote scripts into messages
//! with troubleshooting suggestions. The text ends up on the executor's
//! stderr, which the orchestrator shows as the device's error.

use crate::error::Error;
use crate::remote::protocol::RemoteCommand;

/// Analyzes an SSH connection error and provides helpful suggestions.
pub fn diagnose_ssh_error(error: &Error, host: &str, port: u16) -> String {
    let detail = match error {
        Error::Connection(msg) => msg.clone(),
        other => other.to_string(),
    };
    let error_str = detail.to_lowercase();

    let mut suggestions = Vec::new();

    // Network connectivity issues
    if error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("no route to host")
        || error_str.contains("resolve")
    {
        suggestions.push(format!("• Verify the device '{}' is powered and reachable", host));
        suggestions.push(format!(
            "• Check if SSH is running on port {} (try: ssh -p {} {})",
            port, port, host
        ));
        suggestions.push("• Verify your network connection and firewall settings".to_string());
    }

    // Authentication issues
    if error_str.contains("authentication") || error_str.contains("permission denied") {
        suggestions.push("• Check the user and password in the settings file".to_string());
        suggestions.push(format!(
            "• Or override them with the {} / {} environment variables",
            crate::config::ENV_USER,
            crate::config::ENV_PASSWORD
        ));
    }

    // Generic issues
    if suggestions.is_empty() {
        suggestions.push("• Verify the remote host is accessible".to_string());
        suggestions.push(format!(
            "• Test the connection manually: ssh -p {} {}",
            port, host
        ));
    }

    format!(
        "SSH connection to {} failed: {}\n\nTroubleshooting suggestions:\n{}",
        host,
        detail,
        suggestions.join("\n")
    )
}

/// Adds a hint for shell failures the remote scripts do not explain
/// themselves. Returns `stderr` unchanged when no hint applies.
pub fn diagnose_command_failure(command: RemoteCommand, exit_code: i32, stderr: &str) -> String {
    let lower = stderr.to_lowercase();

    let hint = match command {
        RemoteCommand::Compile if exit_code == 127 || missing_tool(&lower, "make") => {
            Some("make is not installed on the device (try: sudo apt install build-essential)")
        }
        RemoteCommand::Stop if missing_tool(&lower, "killall") => {
            Some("killall is not installed on the device (try: sudo apt install psmisc)")
        }
        RemoteCommand::Status if missing_tool(&lower, "pidof") => {
            Some("pidof is not available on the device")
        }
        _ if lower.contains("no space left") => Some("The device's filesystem is full"),
        _ => None,
    };

    match hint {
        Some(hint) if stderr.trim().is_empty() => hint.to_string(),
        Some(hint) => format!("{}\n{}", stderr.trim_end(), hint),
        None => stderr.to_string(),
    }
}

/// `sh: make: not found` or `bash: make: command not found`
fn missing_tool(stderr: &str, tool: &str) -> bool {
    stderr.contains(&format!("{}: not found", tool))
        || stderr.contains(&format!("{}: command not found", tool))
}
