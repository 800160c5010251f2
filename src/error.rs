use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LivemigError {
    #[error(
        "Host '{host}' cannot admit VM-{vm_id} ({requested_mb} MB): load {load_mb}/{capacity_mb} MB"
    )]
    AdmissionDenied {
        host: String,
        vm_id: u32,
        requested_mb: u64,
        load_mb: u64,
        capacity_mb: u64,
    },

    #[error("Host '{0}' already has a migration in progress")]
    MigrationAlreadyInProgress(String),

    #[error("Host '{0}' has no running VM eligible for migration")]
    NoEligibleVm(String),

    #[error("{what} did not shut down within {timeout:?}")]
    ShutdownTimeout { what: String, timeout: Duration },

    #[error("VM-{vm_id} not found on host '{host}'")]
    VmNotFound { host: String, vm_id: u32 },

    #[error("VM-{vm_id} is already resident on host '{host}'")]
    DuplicateVm { host: String, vm_id: u32 },

    #[error("VM-{vm_id} cannot be migrated while {state}")]
    VmNotRunning { vm_id: u32, state: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Serde(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl From<toml::de::Error> for LivemigError {
    fn from(err: toml::de::Error) -> Self {
        LivemigError::Serde(err.to_string())
    }
}

impl From<serde_json::Error> for LivemigError {
    fn from(err: serde_json::Error) -> Self {
        LivemigError::Serde(err.to_string())
    }
}

impl From<tokio::task::JoinError> for LivemigError {
    fn from(err: tokio::task::JoinError) -> Self {
        LivemigError::TaskFailed(err.to_string())
    }
}
