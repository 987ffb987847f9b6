//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a kernel instance
///
/// Stable for the kernel's lifetime and used as the correlation key for the
/// response channel and for logging.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelId(pub String);

impl KernelId {
    /// Create a new kernel ID from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random kernel ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for KernelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for KernelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The forwarded channels of a kernel connection
///
/// The first five are the kernel's standard messaging channels. The
/// communication channel is an optional listener the launcher exposes for
/// receiving signal and shutdown requests; it is not a messaging channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelChannel {
    /// Request/reply channel
    Shell,
    /// Broadcast channel
    IoPub,
    /// Raw-input channel
    Stdin,
    /// Heartbeat channel
    Heartbeat,
    /// Control channel
    Control,
    /// Optional launcher communication listener
    Communication,
}

impl KernelChannel {
    /// The five standard kernel channels, in connection-info order
    pub const STANDARD: [KernelChannel; 5] = [
        KernelChannel::Shell,
        KernelChannel::IoPub,
        KernelChannel::Stdin,
        KernelChannel::Heartbeat,
        KernelChannel::Control,
    ];

    /// Short channel tag used in logs and tunnel tracking
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelChannel::Shell => "SHELL",
            KernelChannel::IoPub => "IOPUB",
            KernelChannel::Stdin => "STDIN",
            KernelChannel::Heartbeat => "HB",
            KernelChannel::Control => "CONTROL",
            KernelChannel::Communication => "COMM",
        }
    }
}

impl fmt::Display for KernelChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_id_generate_unique() {
        let a = KernelId::generate();
        let b = KernelId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_channel_tags() {
        assert_eq!(KernelChannel::Heartbeat.as_str(), "HB");
        assert_eq!(format!("{}", KernelChannel::Communication), "COMM");
        assert_eq!(KernelChannel::STANDARD.len(), 5);
    }
}
