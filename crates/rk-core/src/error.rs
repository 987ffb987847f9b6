//! Error taxonomy for kernel provisioning

use std::path::PathBuf;
use thiserror::Error;

use crate::types::KernelId;

/// Top-level error type for kernel provisioning
///
/// Variants here are fatal to the operation that produced them. Transient
/// conditions (per-attempt receive timeouts, unreachable signal listeners)
/// are recovered locally and never surface through this type.
#[derive(Error, Debug)]
pub enum ProvisionerError {
    /// Configuration error - fatal at construction, never retried
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Kernel user failed authorization checks
    #[error(
        "User '{user}' is {reason} to start kernels. Ensure KERNEL_USERNAME \
         is set to an appropriate value and retry the request."
    )]
    NotAuthorized { user: String, reason: String },

    /// Launch deadline exhausted while awaiting connection info
    #[error(
        "Kernel '{kernel_id}' launch timed out: waited too long ({timeout_secs}s) \
         to get connection info"
    )]
    LaunchTimeout { kernel_id: KernelId, timeout_secs: u64 },

    /// Local launch fault detected before confirmation completed
    #[error("Error occurred during launch of kernel '{kernel_id}': {message}")]
    LaunchFault { kernel_id: KernelId, message: String },

    /// Tunnel setup error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Response channel failed while awaiting connection info
    #[error("Failure waiting for connection info for kernel '{kernel_id}' on host '{host}': {message}")]
    Response {
        kernel_id: KernelId,
        host: String,
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Port range string is not of the form "lower..upper"
    #[error("Port range validation failed for range '{range}': expected 'lower..upper'")]
    PortRangeFormat { range: String },

    /// Port range is non-empty but narrower than the minimum width
    #[error("Port range validation failed for range '{range}': range size must be at least {minimum}")]
    PortRangeTooNarrow { range: String, minimum: u16 },

    /// A port-range bound lies outside the permitted port space
    #[error("Invalid port range '{range}': valid port numbers lie in (1024, 65535)")]
    PortOutOfBounds { range: String, port: u32 },

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Tunnel- and port-allocation errors
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Passwordless SSH to the remote host is not available
    #[error(
        "Must use password-less SSH scheme: set up the SSH public key on host '{host}'"
    )]
    PasswordlessSshRequired { host: String },

    /// Spawning the tunnel child process failed
    #[error("Could not open SSH tunnel for channel {channel}: {source}")]
    Spawn {
        channel: String,
        #[source]
        source: std::io::Error,
    },

    /// Bind retries exhausted within the configured port range
    #[error("Failed to locate port within range '{range}' after {retries} retries")]
    PortRangeExhausted { range: String, retries: u32 },
}
