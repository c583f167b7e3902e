use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Command failed with exit code {exit_code}: {stderr}")]
    Command { exit_code: i32, stderr: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("No device selected")]
    NothingSelected,

    #[error("A batch is still in flight ({0} operation(s) outstanding)")]
    Busy(usize),
}

pub type Error = FleetError;
pub type Result<T> = std::result::Result<T, Error>;
