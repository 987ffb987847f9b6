//! Provisioner configuration
//!
//! One immutable `ProvisionerConfig` is constructed per provisioner
//! instance. Values come from defaults, a TOML file, or environment
//! overrides via [`ProvisionerConfig::from_env`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;

/// Minimum width of a non-empty port range
pub const MIN_PORT_RANGE_SIZE: u16 = 1000;

/// Number of seconds in 100 years, used as the default tunnel keep-alive
/// interval so idle tunnels are not dropped by intermediate network
/// equipment.
const MAX_KEEP_ALIVE_INTERVAL: u64 = 100 * 365 * 24 * 60 * 60;

/// Configuration for a kernel provisioner instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Port range from which ephemeral ports are chosen, as "lower..upper".
    /// A range of zero width (e.g. "0..0") disables range enforcement.
    pub port_range: String,

    /// Deadline for a launched kernel to report its connection info
    #[serde(with = "duration_secs")]
    pub launch_timeout: Duration,

    /// User names allowed to launch kernels. Empty means "everyone not
    /// explicitly unauthorized".
    pub authorized_users: HashSet<String>,

    /// User names never allowed to launch kernels. Takes precedence over
    /// `authorized_users`.
    pub unauthorized_users: HashSet<String>,

    /// Uid values denied for container-based kernels
    pub prohibited_uids: HashSet<String>,

    /// Gid values denied for container-based kernels
    pub prohibited_gids: HashSet<String>,

    /// SSH port used for tunnel child processes
    pub ssh_port: u16,

    /// ServerAliveInterval passed to tunnel child processes, in seconds
    pub keep_alive_interval: u64,

    /// Whether kernel channels are reached through SSH tunnels
    pub tunneling_enabled: bool,

    /// Sleep between confirmation/poll iterations
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Maximum poll iterations for `wait()` once no local handle exists
    pub max_poll_attempts: u32,

    /// Connect/send timeout for the in-band listener socket. Deliberately
    /// tiny: the listener is same-host or low-latency, so a slow response
    /// means "unreachable", not "wait longer".
    #[serde(with = "duration_millis")]
    pub socket_timeout: Duration,

    /// Consecutive bind failures tolerated per selected port
    pub max_port_retries: u32,

    /// Image name for container-based kernels
    pub image_name: Option<String>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            port_range: "0..0".to_string(),
            launch_timeout: Duration::from_secs(30),
            authorized_users: HashSet::new(),
            unauthorized_users: ["root".to_string()].into_iter().collect(),
            prohibited_uids: ["0".to_string()].into_iter().collect(),
            prohibited_gids: ["0".to_string()].into_iter().collect(),
            ssh_port: 22,
            keep_alive_interval: MAX_KEEP_ALIVE_INTERVAL,
            tunneling_enabled: false,
            poll_interval: Duration::from_millis(500),
            max_poll_attempts: 10,
            socket_timeout: Duration::from_millis(5),
            max_port_retries: 5,
            image_name: None,
        }
    }
}

impl ProvisionerConfig {
    /// Build a configuration from defaults plus `RP_*` environment
    /// overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(range) = std::env::var("RP_PORT_RANGE") {
            config.port_range = range;
        }
        if let Some(secs) = env_f64("RP_LAUNCH_TIMEOUT").or_else(|| env_f64("KERNEL_LAUNCH_TIMEOUT"))
        {
            config.launch_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(users) = env_set("RP_AUTHORIZED_USERS") {
            config.authorized_users = users;
        }
        if let Some(users) = env_set("RP_UNAUTHORIZED_USERS") {
            config.unauthorized_users = users;
        }
        if let Some(uids) = env_set("RP_PROHIBITED_UIDS") {
            config.prohibited_uids = uids;
        }
        if let Some(gids) = env_set("RP_PROHIBITED_GIDS") {
            config.prohibited_gids = gids;
        }
        if let Some(port) = env_parse::<u16>("RP_SSH_PORT") {
            config.ssh_port = port;
        }
        if let Some(interval) = env_parse::<u64>("RP_TUNNEL_MAX_KEEP_ALIVE") {
            config.keep_alive_interval = interval;
        }
        if let Ok(enabled) = std::env::var("RP_ENABLE_TUNNELING") {
            config.tunneling_enabled = enabled.eq_ignore_ascii_case("true");
        }
        if let Some(secs) = env_f64("RP_POLL_INTERVAL") {
            config.poll_interval = Duration::from_secs_f64(secs);
        }
        if let Some(attempts) = env_parse::<u32>("RP_MAX_POLL_ATTEMPTS") {
            config.max_poll_attempts = attempts;
        }
        if let Some(secs) = env_f64("RP_SOCKET_TIMEOUT") {
            config.socket_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(retries) = env_parse::<u32>("RP_MAX_PORT_RANGE_RETRIES") {
            config.max_port_retries = retries;
        }
        if let Ok(image) = std::env::var("RP_IMAGE_NAME") {
            config.image_name = Some(image);
        }

        config
    }

    /// Parse and validate this configuration's port range
    pub fn parsed_port_range(&self) -> Result<(u16, u16), ConfigError> {
        parse_port_range(&self.port_range)
    }
}

/// Parse a "lower..upper" port range string, validating bounds
///
/// A zero-width range (including the empty string) disables enforcement and
/// yields `(0, 0)`. Non-empty ranges must be at least
/// [`MIN_PORT_RANGE_SIZE`] wide, with both bounds inside `[1024, 65535]`.
pub fn parse_port_range(range: &str) -> Result<(u16, u16), ConfigError> {
    if range.is_empty() {
        return Ok((0, 0));
    }

    let (lower_str, upper_str) =
        range
            .split_once("..")
            .ok_or_else(|| ConfigError::PortRangeFormat {
                range: range.to_string(),
            })?;

    let lower: u32 = lower_str
        .trim()
        .parse()
        .map_err(|_| ConfigError::PortRangeFormat {
            range: range.to_string(),
        })?;
    let upper: u32 = upper_str
        .trim()
        .parse()
        .map_err(|_| ConfigError::PortRangeFormat {
            range: range.to_string(),
        })?;

    if upper < lower {
        return Err(ConfigError::PortRangeFormat {
            range: range.to_string(),
        });
    }

    let width = upper - lower;
    if width == 0 {
        return Ok((0, 0));
    }
    if width < u32::from(MIN_PORT_RANGE_SIZE) {
        return Err(ConfigError::PortRangeTooNarrow {
            range: range.to_string(),
            minimum: MIN_PORT_RANGE_SIZE,
        });
    }

    for port in [lower, upper] {
        if !(1024..=65535).contains(&port) {
            return Err(ConfigError::PortOutOfBounds {
                range: range.to_string(),
                port,
            });
        }
    }

    Ok((lower as u16, upper as u16))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

// Duration::from_secs_f64 panics on negative or non-finite input, so such
// values are ignored like any other malformed override.
fn env_f64(name: &str) -> Option<f64> {
    env_parse::<f64>(name).filter(|secs| secs.is_finite() && *secs >= 0.0)
}

fn env_set(name: &str) -> Option<HashSet<String>> {
    std::env::var(name).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
