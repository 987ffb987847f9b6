//! Startup confirmation state machine
//!
//! After a kernel is launched, the provisioner polls under a deadline until
//! the kernel's connection payload arrives via the response channel. The
//! loop is an explicit state machine so each kernel's confirmation runs
//! independently, with its own deadline clock, on the caller's runtime.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use rk_core::KernelId;

use crate::response::{ConnectionInfo, ResponseChannel, ResponseError};

/// States of one confirmation protocol run
///
/// `Confirmed`, `TimedOut`, and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationState {
    /// Between iterations, waiting out the poll interval
    Waiting,
    /// Querying the variant's status primitive
    CheckingAlive,
    /// Connection info received
    Confirmed,
    /// Launch deadline exhausted
    TimedOut,
    /// Launch fault or response-channel failure
    Failed,
}

/// What the variant's status primitive reports for one iteration
#[derive(Debug, Clone)]
pub enum KernelStatus {
    /// No observable activity yet (e.g. container not scheduled)
    Starting,
    /// Launch activity observed; host assignment may still be pending
    Active { assigned_host: Option<String> },
    /// The launch has already faulted; fail fast instead of waiting out
    /// the timeout
    Faulted(String),
}

/// Variant-specific status query driven by the confirmation loop
///
/// `iteration` tags repeated queries so implementations can poll
/// idempotently and keep their logging readable.
#[async_trait]
pub trait StartupProbe: Send {
    async fn query_status(&mut self, iteration: u32) -> KernelStatus;
}

/// Terminal result of a confirmation run
#[derive(Debug)]
pub enum ConfirmOutcome {
    /// The kernel reported its connection payload
    Confirmed(Box<ConnectionInfo>),
    /// The deadline elapsed; the caller is expected to kill the kernel
    /// before surfacing the timeout
    TimedOut { waited: Duration },
    /// The launch faulted before confirmation
    Faulted { message: String },
    /// The response channel failed in a non-timeout way
    ResponseFailure { message: String },
}

/// Deadline-bounded confirmation loop for one kernel
pub struct ConfirmationEngine {
    kernel_id: KernelId,
    launch_timeout: Duration,
    poll_interval: Duration,
    state: ConfirmationState,
    start_time: Instant,
}

impl ConfirmationEngine {
    pub fn new(kernel_id: KernelId, launch_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            kernel_id,
            launch_timeout,
            poll_interval,
            state: ConfirmationState::Waiting,
            start_time: Instant::now(),
        }
    }

    /// Current protocol state
    pub fn state(&self) -> ConfirmationState {
        self.state
    }

    /// Elapsed time since this run started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Drive the protocol to a terminal state
    ///
    /// Each iteration: sleep one poll interval, check the deadline, query
    /// the probe, and - once a host is assigned - attempt to receive the
    /// connection payload. A per-attempt receive timeout is not fatal; it
    /// loops back to `Waiting`.
    pub async fn run<P: StartupProbe + ?Sized>(
        &mut self,
        probe: &mut P,
        responses: &dyn ResponseChannel,
    ) -> ConfirmOutcome {
        self.state = ConfirmationState::Waiting;
        self.start_time = Instant::now();
        let mut iteration: u32 = 0;

        loop {
            iteration += 1;
            tokio::time::sleep(self.poll_interval).await;

            let waited = self.start_time.elapsed();
            if waited > self.launch_timeout {
                self.state = ConfirmationState::TimedOut;
                return ConfirmOutcome::TimedOut { waited };
            }

            self.state = ConfirmationState::CheckingAlive;
            match probe.query_status(iteration).await {
                KernelStatus::Faulted(message) => {
                    self.state = ConfirmationState::Failed;
                    return ConfirmOutcome::Faulted { message };
                }
                KernelStatus::Active {
                    assigned_host: Some(host),
                } => match responses.get_connection_info(&self.kernel_id).await {
                    Ok(info) => {
                        self.state = ConfirmationState::Confirmed;
                        return ConfirmOutcome::Confirmed(Box::new(info));
                    }
                    Err(ResponseError::Timeout) => {
                        tracing::debug!(
                            kernel_id = %self.kernel_id,
                            "Waiting for kernel to send connection info from host '{}' - retrying",
                            host
                        );
                        self.state = ConfirmationState::Waiting;
                    }
                    Err(ResponseError::Other(message)) => {
                        self.state = ConfirmationState::Failed;
                        return ConfirmOutcome::ResponseFailure { message };
                    }
                },
                _ => {
                    self.state = ConfirmationState::Waiting;
                }
            }
        }
    }
}
