//! rk-provisioner: remote kernel launch confirmation and lifecycle management
//!
//! This crate launches a compute kernel on the local host, a remote host
//! reachable via SSH, or inside a container runtime; confirms the kernel has
//! become reachable; and manages its lifecycle (signaling, graceful
//! termination, forced kill, cleanup) even when the kernel is invisible to
//! direct OS inspection from the orchestrating node.
//!
//! The pieces:
//!
//! - [`ports::PortAllocator`] - ephemeral port selection constrained to a
//!   configured range
//! - [`tunnel::TunnelManager`] - SSH tunnel child processes, one per kernel
//!   channel
//! - [`signal::SignalDispatcher`] - degrading signal delivery (in-band
//!   listener, process group, direct pid)
//! - [`confirm::ConfirmationEngine`] - deadline-bounded startup confirmation
//! - [`provisioner::KernelProvisioner`] - the lifecycle contract, with
//!   process ([`process::ProcessProvisioner`]) and container
//!   ([`container::ContainerProvisioner`]) variants

pub mod confirm;
pub mod container;
pub mod listener;
pub mod ports;
pub mod process;
pub mod provisioner;
pub mod response;
pub mod signal;
pub mod tunnel;

pub use confirm::{ConfirmOutcome, ConfirmationEngine, ConfirmationState, KernelStatus, StartupProbe};
pub use container::{ContainerProvisioner, ContainerRuntime, ContainerStatus};
pub use ports::PortAllocator;
pub use process::ProcessProvisioner;
pub use provisioner::{KernelProvisioner, ProvisionerCore, ProvisionerState};
pub use response::{ConnectionInfo, ResponseChannel, ResponseError};
pub use signal::{SignalDispatcher, SignalOutcome};
pub use tunnel::TunnelManager;
