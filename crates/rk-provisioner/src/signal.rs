//! Degrading signal delivery
//!
//! Signals reach the kernel through the first available of three tiers: the
//! kernel's in-band listener socket, the local process group, or the local
//! process itself. A kernel with none of these (a container, or a fully
//! remote process with no comm channel) is simply not signalable from here.

use std::time::Duration;

use rk_core::KernelId;

use crate::listener::{send_listener_request, ListenerRequest, ListenerSendResult};

/// Forced-kill signal number
pub const SIGKILL: i32 = 9;
/// Catchable termination signal number
pub const SIGTERM: i32 = 15;

/// Result of a signal delivery attempt
///
/// `Undeliverable` is informational, not an error: the original fallthrough
/// was silent, and callers that don't care may ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The signal reached the kernel (or the listener port was refused,
    /// meaning there is no process left to signal)
    Delivered,
    /// No listener, no process group, no local process handle
    Undeliverable,
}

/// Per-call view of the signaling paths available for one kernel
#[derive(Debug, Clone)]
pub struct SignalDispatcher {
    kernel_id: KernelId,
    comm_ip: Option<String>,
    comm_port: u16,
    pid: i32,
    pgid: i32,
    /// Whether a local process handle still exists for tier-3 delivery
    has_local_process: bool,
    socket_timeout: Duration,
}

impl SignalDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kernel_id: KernelId,
        comm_ip: Option<String>,
        comm_port: u16,
        pid: i32,
        pgid: i32,
        has_local_process: bool,
        socket_timeout: Duration,
    ) -> Self {
        Self {
            kernel_id,
            comm_ip,
            comm_port,
            pid,
            pgid,
            has_local_process,
            socket_timeout,
        }
    }

    /// Deliver `signum`, degrading through the tiers
    pub async fn send_signal(&self, signum: i32) -> SignalOutcome {
        if self.send_via_listener(signum).await {
            return SignalOutcome::Delivered;
        }
        self.signal_process(signum)
    }

    /// Tier 2/3 only: process-group signal, then direct process signal
    ///
    /// Used for kill/terminate, which bypass the listener so the raw signal
    /// reaches the OS process even when a listener exists.
    pub fn signal_process(&self, signum: i32) -> SignalOutcome {
        #[cfg(unix)]
        {
            if self.has_local_process {
                if self.pgid > 0 {
                    // SAFETY: plain killpg syscall; no memory is touched.
                    let rc = unsafe { libc::killpg(self.pgid, signum) };
                    if rc == 0 {
                        return SignalOutcome::Delivered;
                    }
                    // Group signal failure falls through to the direct path.
                }
                if self.pid > 0 {
                    // SAFETY: plain kill syscall; no memory is touched.
                    let rc = unsafe { libc::kill(self.pid, signum) };
                    if rc == 0 {
                        return SignalOutcome::Delivered;
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = signum;
        }

        tracing::debug!(
            kernel_id = %self.kernel_id,
            "No delivery path available for signal ({})",
            signum
        );
        SignalOutcome::Undeliverable
    }

    /// Tier 1: send the signal request through the in-band listener
    ///
    /// Returns whether the request was delivered (a refused connection
    /// counts: there is no process to signal).
    async fn send_via_listener(&self, signum: i32) -> bool {
        if self.comm_port == 0 {
            return false;
        }
        let Some(comm_ip) = self.comm_ip.as_deref() else {
            return false;
        };

        let request = ListenerRequest::Signal { signum };
        match send_listener_request(comm_ip, self.comm_port, &request, self.socket_timeout, false)
            .await
        {
            ListenerSendResult::Sent => {
                if signum > 0 {
                    // Liveness probes (signum 0) are too frequent to log.
                    tracing::debug!(
                        kernel_id = %self.kernel_id,
                        "Signal ({}) sent via communication port",
                        signum
                    );
                }
                true
            }
            ListenerSendResult::Refused => true,
            ListenerSendResult::Failed(kind) => {
                tracing::warn!(
                    kernel_id = %self.kernel_id,
                    "Unexpected failure sending signal ({}) via listener: {:?}",
                    signum,
                    kind
                );
                false
            }
        }
    }

    /// Send the shutdown directive through the in-band listener
    ///
    /// Returns whether the directive was written (refused counts as done).
    pub async fn send_shutdown(&self) -> bool {
        if self.comm_port == 0 {
            return false;
        }
        let Some(comm_ip) = self.comm_ip.as_deref() else {
            return false;
        };

        match send_listener_request(
            comm_ip,
            self.comm_port,
            &ListenerRequest::shutdown(),
            self.socket_timeout,
            true,
        )
        .await
        {
            ListenerSendResult::Sent => {
                tracing::debug!(
                    kernel_id = %self.kernel_id,
                    "Shutdown request sent to listener via communication port"
                );
                true
            }
            ListenerSendResult::Refused => true,
            ListenerSendResult::Failed(kind) => {
                tracing::warn!(
                    kernel_id = %self.kernel_id,
                    "Unexpected failure sending listener shutdown to {}:{}: {:?}",
                    comm_ip,
                    self.comm_port,
                    kind
                );
                false
            }
        }
    }
}
