//! Ephemeral port selection constrained to a configured range

use std::net::TcpListener;

use rand::Rng;

use rk_core::config::parse_port_range;
use rk_core::{ConfigError, TunnelError};

/// Selects currently-unbound local ports, honoring a configured range
///
/// Each port is chosen by binding a throwaway socket to a candidate port and
/// reading back the assigned port. Allocation is advisory: nothing holds the
/// port between selection and actual use, and the small race window this
/// implies is handled by the bind-retry policy.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    lower_port: u16,
    upper_port: u16,
    max_retries: u32,
}

impl PortAllocator {
    /// Create an allocator from a "lower..upper" range string
    ///
    /// Range validation happens here, once, so that misconfiguration fails
    /// before any launch is attempted.
    pub fn new(port_range: &str, max_retries: u32) -> Result<Self, ConfigError> {
        let (lower_port, upper_port) = parse_port_range(port_range)?;
        Ok(Self {
            lower_port,
            upper_port,
            max_retries,
        })
    }

    /// The inclusive range bounds, `(0, 0)` when unconstrained
    pub fn range(&self) -> (u16, u16) {
        (self.lower_port, self.upper_port)
    }

    /// Select `count` distinct, currently-unbound ports
    ///
    /// All sockets are held until every port has been chosen so the same
    /// port is not returned twice, then released together.
    pub fn select_ports(&self, count: usize) -> Result<Vec<u16>, TunnelError> {
        let mut ports = Vec::with_capacity(count);
        let mut sockets = Vec::with_capacity(count);
        for _ in 0..count {
            let socket = self.select_socket()?;
            let port = socket
                .local_addr()
                .map_err(|_| self.exhausted())?
                .port();
            ports.push(port);
            sockets.push(socket);
        }
        drop(sockets);
        Ok(ports)
    }

    /// Bind a socket whose port adheres to the configured range
    fn select_socket(&self) -> Result<TcpListener, TunnelError> {
        let mut retries = 0;
        loop {
            match TcpListener::bind(("127.0.0.1", self.candidate_port())) {
                Ok(socket) => return Ok(socket),
                Err(_) => {
                    retries += 1;
                    if retries > self.max_retries {
                        return Err(self.exhausted());
                    }
                }
            }
        }
    }

    /// Pick a candidate port uniformly within the range, or 0 (OS-assigned)
    /// when no range is configured
    fn candidate_port(&self) -> u16 {
        if self.upper_port == self.lower_port {
            return 0;
        }
        rand::thread_rng().gen_range(self.lower_port..=self.upper_port)
    }

    fn exhausted(&self) -> TunnelError {
        TunnelError::PortRangeExhausted {
            range: format!("{}..{}", self.lower_port, self.upper_port),
            retries: self.max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_narrow_range() {
        let result = PortAllocator::new("40000..40100", 5);
        assert!(matches!(
            result,
            Err(ConfigError::PortRangeTooNarrow { .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_bounds_range() {
        assert!(PortAllocator::new("500..65535", 5).is_err());
        assert!(PortAllocator::new("1024..70000", 5).is_err());
    }

    #[test]
    fn test_unconstrained_selection() {
        let allocator = PortAllocator::new("0..0", 5).unwrap();
        let ports = allocator.select_ports(5).unwrap();
        assert_eq!(ports.len(), 5);
        for port in &ports {
            assert!(*port > 0);
        }
    }

    #[test]
    fn test_ports_within_configured_range() {
        let allocator = PortAllocator::new("30000..40000", 5).unwrap();
        let ports = allocator.select_ports(6).unwrap();
        for port in ports {
            assert!((30000..=40000).contains(&port), "port {} out of range", port);
        }
    }

    #[test]
    fn test_ports_are_distinct() {
        let allocator = PortAllocator::new("", 5).unwrap();
        let ports = allocator.select_ports(5).unwrap();
        let mut unique = ports.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ports.len());
    }
}
