//! Agent configuration loaded from YAML file + environment variable overrides.
//!
//! Configuration file location: /etc/teleop/agent.yaml (default, optional)
//! Override via environment: TELEOP_CONFIG=/path/to/config.yaml (must exist)
//!
//! The room token is usually supplied through TELEOP_TOKEN rather than the
//! file so it stays out of configuration management.

use std::net::SocketAddr;
use std::path::Path;

use adapter_trait::AdapterType;
use anyhow::{ensure, Context, Result};
use command_router::RouterConfig;
use mavlink_adapter::MavlinkConfig;
use serde::Deserialize;
use serial_line_adapter::SerialLineConfig;
use session_bridge::BridgeConfig;
use uplink_relay::UplinkConfig;

const DEFAULT_CONFIG_PATH: &str = "/etc/teleop/agent.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Room connection: rendezvous URL, room, identity, token, topics.
    #[serde(default)]
    pub session: BridgeConfig,

    /// Local capture endpoint and codec.
    #[serde(default)]
    pub uplink: UplinkConfig,

    /// Cadence, watchdog and validation policy.
    #[serde(default)]
    pub router: RouterConfig,

    /// Which actuator adapter drives the robot.
    #[serde(default = "default_adapter")]
    pub adapter: AdapterType,

    /// Serial line adapter settings (used when adapter = "serial_line")
    #[serde(default)]
    pub serial_line: SerialLineConfig,

    /// MAVLink adapter settings (used when adapter = "mavlink_udp")
    #[serde(default)]
    pub mavlink: MavlinkConfig,

    /// Metrics export (Prometheus scrape endpoint)
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Log level: "trace", "debug", "info", "warn", "error". RUST_LOG wins.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Bind address for Prometheus scrape endpoint.
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { bind_addr: default_metrics_addr() }
    }
}

fn default_adapter() -> AdapterType { AdapterType::SerialLine }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_addr() -> String { "127.0.0.1:9090".to_string() }

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            session:     BridgeConfig::default(),
            uplink:      UplinkConfig::default(),
            router:      RouterConfig::default(),
            adapter:     default_adapter(),
            serial_line: SerialLineConfig::default(),
            mavlink:     MavlinkConfig::default(),
            metrics:     MetricsConfig::default(),
            log_level:   default_log_level(),
        }
    }
}

impl AgentConfig {
    /// File (if any), then environment, then validation.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("TELEOP_CONFIG").ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut config = if explicit.is_some() || Path::new(&path).exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Cannot read config file {path}"))?;
            Self::from_yaml(&content).with_context(|| format!("Invalid config file {path}"))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty file is a valid "all defaults" config.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `TELEOP_*` overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TELEOP_URL")      { self.session.url = v; }
        if let Some(v) = lookup("TELEOP_TOKEN")    { self.session.token = v; }
        if let Some(v) = lookup("TELEOP_ROOM")     { self.session.room = v; }
        if let Some(v) = lookup("TELEOP_IDENTITY") { self.session.identity = v; }
        if let Some(v) = lookup("TELEOP_ACTUATOR_PORT") {
            match self.adapter {
                AdapterType::SerialLine => self.serial_line.port = v,
                AdapterType::MavlinkUdp => {
                    self.mavlink.addr = v.parse()
                        .with_context(|| format!("TELEOP_ACTUATOR_PORT={v} is not a UDP address"))?;
                }
            }
        }
        if let Some(v) = lookup("TELEOP_CADENCE_HZ") {
            self.router.cadence_hz = v.parse()
                .with_context(|| format!("TELEOP_CADENCE_HZ={v} is not an integer"))?;
        }
        if let Some(v) = lookup("TELEOP_WATCHDOG_MS") {
            self.router.watchdog_ms = v.parse()
                .with_context(|| format!("TELEOP_WATCHDOG_MS={v} is not an integer"))?;
        }
        if let Some(v) = lookup("TELEOP_CONNECT_TIMEOUT_MS") {
            self.session.connect_timeout_ms = v.parse()
                .with_context(|| format!("TELEOP_CONNECT_TIMEOUT_MS={v} is not an integer"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.session;
        ensure!(!s.url.is_empty(), "session.url is required (or set TELEOP_URL)");
        ensure!(
            s.url.starts_with("ws://") || s.url.starts_with("wss://"),
            "session.url must be a ws:// or wss:// URL, got {}", s.url
        );
        ensure!(!s.room.is_empty(), "session.room is required (or set TELEOP_ROOM)");
        ensure!(!s.identity.is_empty(), "session.identity is required (or set TELEOP_IDENTITY)");
        ensure!(!s.token.is_empty(), "session.token is required (or set TELEOP_TOKEN)");
        ensure!(s.connect_timeout_ms > 0, "session.connect_timeout_ms must be positive");
        ensure!(s.reconnect_attempts > 0, "session.reconnect_attempts must be at least 1");
        ensure!(s.reconnect_base_ms <= s.reconnect_max_ms, "session.reconnect_base_ms exceeds reconnect_max_ms");
        ensure!(s.inbound_queue_depth > 0, "session.inbound_queue_depth must be positive");
        ensure!(
            s.control_topic != s.command_topic && s.control_topic != s.status_topic,
            "session topics must be distinct"
        );

        let r = &self.router;
        ensure!((1..=1000).contains(&r.cadence_hz), "router.cadence_hz must be within 1..=1000");
        ensure!(
            r.watchdog_ms >= r.tick().as_millis() as u64,
            "router.watchdog_ms ({}) is shorter than one cadence tick", r.watchdog_ms
        );
        ensure!(r.link_failure_threshold > 0, "router.link_failure_threshold must be positive");
        ensure!(
            r.max_throttle > 0.0 && r.max_throttle <= 1.0,
            "router.max_throttle must be within (0, 1]"
        );
        ensure!(r.max_speed_mps > 0.0, "router.max_speed_mps must be positive");

        let u = &self.uplink;
        ensure!(u.retry_base_ms <= u.retry_max_ms, "uplink.retry_base_ms exceeds retry_max_ms");
        ensure!(u.max_consecutive_failures > 0, "uplink.max_consecutive_failures must be positive");
        ensure!(u.read_buffer_bytes > 0, "uplink.read_buffer_bytes must be positive");

        if self.adapter == AdapterType::SerialLine {
            ensure!(!self.serial_line.port.is_empty(), "serial_line.port is required");
        }

        self.metrics_addr()?;
        Ok(())
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        self.metrics.bind_addr.parse()
            .with_context(|| format!("metrics.bind_addr {} is not a socket address", self.metrics.bind_addr))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const MINIMAL: &str = r#"
session:
  url: wss://rtc.example.net
  room: yard
  identity: rover-1
  token: secret
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let config = AgentConfig::from_yaml(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.adapter, AdapterType::SerialLine);
        assert_eq!(config.serial_line.port, "/dev/ttyUSB0");
        assert_eq!(config.serial_line.baud, 115_200);
        assert_eq!(config.router.cadence_hz, 20);
        assert_eq!(config.router.watchdog_ms, 300);
        assert_eq!(config.session.connect_timeout_ms, 10_000);
        assert_eq!(config.session.reconnect_attempts, 5);
        assert_eq!(config.uplink.max_consecutive_failures, 5);
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = AgentConfig::from_yaml(MINIMAL).unwrap();
        config.apply_env(env(&[
            ("TELEOP_TOKEN", "rotated"),
            ("TELEOP_ACTUATOR_PORT", "/dev/ttyACM0"),
            ("TELEOP_CADENCE_HZ", "50"),
            ("TELEOP_WATCHDOG_MS", "200"),
            ("TELEOP_CONNECT_TIMEOUT_MS", "2500"),
        ])).unwrap();
        config.validate().unwrap();
        assert_eq!(config.session.token, "rotated");
        assert_eq!(config.serial_line.port, "/dev/ttyACM0");
        assert_eq!(config.router.cadence_hz, 50);
        assert_eq!(config.router.watchdog_ms, 200);
        assert_eq!(config.session.connect_timeout_ms, 2_500);
    }

    #[test]
    fn actuator_port_follows_adapter() {
        let yaml = format!("{MINIMAL}adapter: mavlink_udp\n");
        let mut config = AgentConfig::from_yaml(&yaml).unwrap();
        config.apply_env(env(&[("TELEOP_ACTUATOR_PORT", "10.0.0.2:14551")])).unwrap();
        assert_eq!(config.mavlink.addr, "10.0.0.2:14551".parse::<SocketAddr>().unwrap());

        let err = config.apply_env(env(&[("TELEOP_ACTUATOR_PORT", "/dev/ttyUSB0")])).unwrap_err();
        assert!(err.to_string().contains("TELEOP_ACTUATOR_PORT"));
    }

    #[test]
    fn missing_required_values_fail_fast() {
        let config = AgentConfig::from_yaml("").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("session.url"));

        let mut config = AgentConfig::from_yaml(MINIMAL).unwrap();
        config.session.token.clear();
        assert!(config.validate().unwrap_err().to_string().contains("TELEOP_TOKEN"));
    }

    #[test]
    fn rejects_inconsistent_values() {
        let mut config = AgentConfig::from_yaml(MINIMAL).unwrap();
        config.apply_env(env(&[("TELEOP_CADENCE_HZ", "fast")])).unwrap_err();

        config.router.cadence_hz = 10;
        config.router.watchdog_ms = 50;
        assert!(config.validate().unwrap_err().to_string().contains("cadence tick"));

        let mut config = AgentConfig::from_yaml(MINIMAL).unwrap();
        config.session.url = "https://rtc.example.net".into();
        assert!(config.validate().is_err());

        let yaml = format!("{}  reconnect_attempts: 0\n", MINIMAL.trim_start());
        let config = AgentConfig::from_yaml(&yaml).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("reconnect_attempts"));
    }

    #[test]
    fn parses_full_sections() {
        let yaml = format!(
            "{MINIMAL}{}",
            r#"
uplink:
  endpoint: { mode: listen, addr: "0.0.0.0:5000" }
  codec: h265
router:
  out_of_range: clamp
  latch_idle_release_ms: 30000
metrics:
  bind_addr: "0.0.0.0:9100"
"#
        );
        let config = AgentConfig::from_yaml(&yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.uplink.codec, uplink_relay::Codec::H265);
        assert_eq!(config.router.out_of_range, command_router::OutOfRangePolicy::Clamp);
        assert_eq!(config.router.latch_idle_release_ms, Some(30_000));
        assert_eq!(config.metrics_addr().unwrap().port(), 9100);
    }
}
