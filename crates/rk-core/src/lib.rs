//! rk-core: Core types, configuration, and errors for remote kernel provisioning
//!
//! This crate provides the shared vocabulary used by the provisioning
//! subsystem: kernel identifiers, channel names, the immutable per-instance
//! configuration, and the error taxonomy.

pub mod config;
pub mod error;
pub mod types;

pub use config::ProvisionerConfig;
pub use error::{ConfigError, ProvisionerError, TunnelError};
pub use types::{KernelChannel, KernelId};
