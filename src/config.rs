use std::{env, path::PathBuf, str::FromStr, time::Duration};

use directories::ProjectDirs;

use crate::error::BridgeError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DISCOVERY_START: u16 = 50000;
pub const DEFAULT_DISCOVERY_END: u16 = 50010;

const STORE_FILE_NAME: &str = "bridge-store.json";

/// What the outbound queue does when it is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    RejectNew,
}

impl FromStr for OverflowPolicy {
    type Err = BridgeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "drop-oldest" => Ok(Self::DropOldest),
            "reject-new" => Ok(Self::RejectNew),
            other => Err(BridgeError::config(format!(
                "overflow policy must be drop-oldest or reject-new, got \"{other}\""
            ))),
        }
    }
}

/// Which channel `emit` delivers through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitTransport {
    /// A callback injected by the host, possibly registered after startup.
    HostHook,
    /// The WebSocket bridge, through the outbound queue.
    Socket,
}

impl FromStr for EmitTransport {
    type Err = BridgeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "host-hook" | "hook" => Ok(Self::HostHook),
            "socket" | "websocket" => Ok(Self::Socket),
            other => Err(BridgeError::config(format!(
                "emit transport must be host-hook or socket, got \"{other}\""
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub discovery_start: u16,
    pub discovery_end: u16,
    pub probe_timeout: Duration,
    pub scan_timeout: Duration,
    pub reconnect_delay: Duration,
    pub rediscover_after_failures: u32,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub emit_transport: EmitTransport,
    pub emit_retry_limit: u32,
    pub emit_retry_delay: Duration,
    pub store_path: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            discovery_start: DEFAULT_DISCOVERY_START,
            discovery_end: DEFAULT_DISCOVERY_END,
            probe_timeout: Duration::from_millis(200),
            scan_timeout: Duration::from_millis(1000),
            reconnect_delay: Duration::from_millis(3000),
            rediscover_after_failures: 3,
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
            emit_transport: EmitTransport::HostHook,
            emit_retry_limit: 60,
            emit_retry_delay: Duration::from_millis(200),
            store_path: default_store_path(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, BridgeError> {
        let defaults = Self::default();

        let host = env::var("ROSE_BRIDGE_HOST")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.host);

        let config = Self {
            host,
            discovery_start: parse_env("ROSE_BRIDGE_DISCOVERY_START")?
                .unwrap_or(defaults.discovery_start),
            discovery_end: parse_env("ROSE_BRIDGE_DISCOVERY_END")?
                .unwrap_or(defaults.discovery_end),
            probe_timeout: parse_millis_env("ROSE_BRIDGE_PROBE_TIMEOUT_MS")?
                .unwrap_or(defaults.probe_timeout),
            scan_timeout: parse_millis_env("ROSE_BRIDGE_SCAN_TIMEOUT_MS")?
                .unwrap_or(defaults.scan_timeout),
            reconnect_delay: parse_millis_env("ROSE_BRIDGE_RECONNECT_DELAY_MS")?
                .unwrap_or(defaults.reconnect_delay),
            rediscover_after_failures: parse_env("ROSE_BRIDGE_REDISCOVER_AFTER")?
                .unwrap_or(defaults.rediscover_after_failures),
            queue_capacity: parse_env("ROSE_BRIDGE_QUEUE_CAPACITY")?
                .unwrap_or(defaults.queue_capacity),
            overflow_policy: parse_env("ROSE_BRIDGE_OVERFLOW")?
                .unwrap_or(defaults.overflow_policy),
            emit_transport: parse_env("ROSE_BRIDGE_EMIT_TRANSPORT")?
                .unwrap_or(defaults.emit_transport),
            emit_retry_limit: parse_env("ROSE_BRIDGE_EMIT_RETRY_LIMIT")?
                .unwrap_or(defaults.emit_retry_limit),
            emit_retry_delay: parse_millis_env("ROSE_BRIDGE_EMIT_RETRY_DELAY_MS")?
                .unwrap_or(defaults.emit_retry_delay),
            store_path: env::var("ROSE_BRIDGE_STORE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .or(defaults.store_path),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.discovery_start == 0 {
            return Err(BridgeError::config("discovery range must start above port 0"));
        }
        if self.discovery_end < self.discovery_start {
            return Err(BridgeError::config(format!(
                "discovery range {}..={} is empty",
                self.discovery_start, self.discovery_end
            )));
        }
        if self.queue_capacity == 0 {
            return Err(BridgeError::config("queue capacity must be at least 1"));
        }
        Ok(())
    }

    pub fn default_port(&self) -> u16 {
        self.discovery_start
    }

    pub fn fallback_port(&self) -> u16 {
        self.discovery_start
            .saturating_add(1)
            .min(self.discovery_end)
    }

    pub fn discovery_ports(&self) -> impl Iterator<Item = u16> {
        self.discovery_start..=self.discovery_end
    }
}

fn default_store_path() -> Option<PathBuf> {
    ProjectDirs::from("", "Rose", "rose-bridge").map(|dirs| dirs.data_dir().join(STORE_FILE_NAME))
}

fn parse_env<T>(name: &str) -> Result<Option<T>, BridgeError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|error| BridgeError::config(format!("{name}: {error}"))),
        _ => Ok(None),
    }
}

fn parse_millis_env(name: &str) -> Result<Option<Duration>, BridgeError> {
    Ok(parse_env::<u64>(name)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_and_fallback_ports_come_from_the_range() {
        let config = BridgeConfig::default();
        assert_eq!(config.default_port(), 50000);
        assert_eq!(config.fallback_port(), 50001);
        assert_eq!(config.discovery_ports().count(), 11);
    }

    #[test]
    fn single_port_range_has_no_distinct_fallback() {
        let config = BridgeConfig {
            discovery_start: 41000,
            discovery_end: 41000,
            ..BridgeConfig::default()
        };
        assert_eq!(config.fallback_port(), 41000);
    }

    #[test]
    fn validate_rejects_inverted_range_and_zero_capacity() {
        let inverted = BridgeConfig {
            discovery_start: 50010,
            discovery_end: 50000,
            ..BridgeConfig::default()
        };
        assert!(matches!(inverted.validate(), Err(BridgeError::Config(_))));

        let no_room = BridgeConfig {
            queue_capacity: 0,
            ..BridgeConfig::default()
        };
        assert!(matches!(no_room.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn policies_parse_from_their_names() {
        assert_eq!(
            "drop-oldest".parse::<OverflowPolicy>().unwrap(),
            OverflowPolicy::DropOldest
        );
        assert_eq!(
            " Reject-New ".parse::<OverflowPolicy>().unwrap(),
            OverflowPolicy::RejectNew
        );
        assert_eq!(
            "socket".parse::<EmitTransport>().unwrap(),
            EmitTransport::Socket
        );
        assert!("carrier-pigeon".parse::<EmitTransport>().is_err());
    }
}
