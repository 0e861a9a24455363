//! Sensor Configuration
//!
//! The JSON document handed to the sensor at start-up. Scheduler and power
//! sections fall back to their defaults key by key. Chain entries are kept as
//! raw JSON values so a malformed entry only fails itself when the chains are
//! built, never the whole document.

use crate::error::{SensorError, SensorResult};
use crate::frame::MacAddr;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use std::path::Path;

/// Largest burst the scheduler accepts
pub const BURST_SIZE_MAX: usize = 512;

/// Top-level configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,
    /// Number of worker cores (one RX/TX queue pair per port each)
    pub cores: usize,
    /// Capture ports
    pub ports: Vec<PortConfig>,
    /// Main loop tuning
    pub scheduler: SchedulerConfig,
    /// Frequency and idle heuristics
    pub power: PowerConfig,
    /// Telemetry interval on the reporting core
    pub stats_interval_secs: u64,
    /// Filter chain entries
    pub pcap_chain: Vec<Value>,
    /// Pattern chain entries
    pub re_chain: Vec<Value>,
    /// Address table entries
    pub cidr_table: Vec<Value>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            cores: 1,
            ports: Vec::new(),
            scheduler: SchedulerConfig::default(),
            power: PowerConfig::default(),
            stats_interval_secs: 10,
            pcap_chain: Vec::new(),
            re_chain: Vec::new(),
            cidr_table: Vec::new(),
        }
    }
}

impl SensorConfig {
    /// Load and validate from file
    pub fn load(path: impl AsRef<Path>) -> SensorResult<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "loading configuration");
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate a JSON document
    pub fn from_json(content: &str) -> SensorResult<Self> {
        let config: Self = serde_json::from_str(content)?;
        if let Err(e) = config.validate() {
            tracing::warn!(error = %e, "configuration rejected");
            return Err(e);
        }
        Ok(config)
    }

    /// Reject settings the main loop cannot run with
    pub fn validate(&self) -> SensorResult<()> {
        if self.cores == 0 {
            return Err(SensorError::ConfigError("cores must be at least 1".into()));
        }
        if self.ports.is_empty() {
            return Err(SensorError::ConfigError("no ports configured".into()));
        }
        let burst = self.scheduler.burst_size;
        if burst == 0 || burst > BURST_SIZE_MAX {
            return Err(SensorError::ConfigError(format!(
                "burst_size {} outside 1..={}",
                burst, BURST_SIZE_MAX
            )));
        }
        if self.power.zero_rx_min == 0 {
            return Err(SensorError::ConfigError("zero_rx_min must be at least 1".into()));
        }
        if self.power.timer_interval_ms == 0 {
            return Err(SensorError::ConfigError("timer_interval_ms must be at least 1".into()));
        }
        let p = &self.power;
        if !(p.batch_1 < p.batch_2 && p.batch_2 < p.batch_3) {
            return Err(SensorError::ConfigError(format!(
                "descriptor offsets must escalate: {} < {} < {}",
                p.batch_1, p.batch_2, p.batch_3
            )));
        }
        Ok(())
    }
}

/// One capture port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Interface name (AF_PACKET) or label (in-memory ports)
    pub interface: String,
    /// Hardware address used in replies; read from the interface when absent
    #[serde(default)]
    pub mac: Option<MacAddr>,
    /// Addresses the sensor answers ARP and echo for
    #[serde(default)]
    pub ip_addrs: Vec<IpAddr>,
    /// Put the interface in promiscuous mode
    #[serde(default = "default_true")]
    pub promiscuous: bool,
}

fn default_true() -> bool {
    true
}

/// Main loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Packets per RX request and TX batch
    pub burst_size: usize,
    /// Flush pending TX batches after this long
    pub tx_drain_usecs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            burst_size: 32,
            tx_drain_usecs: 100,
        }
    }
}

/// Frequency and idle heuristic tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Drive cpufreq through sysfs; otherwise scaling is a no-op
    pub scaling: bool,
    /// Block on receive readiness once idle long enough
    pub interrupts: bool,
    /// Consecutive empty bursts before a port yields an idle hint
    pub zero_rx_min: u64,
    /// Idle hint step per `zero_rx_min` empty bursts
    pub sleep_base_usecs: u32,
    /// Hints below this spin instead of sleeping
    pub busy_wait_max_usecs: u32,
    /// Hints at or above this block on receive readiness
    pub suspend_usecs: u32,
    /// Ceiling for any idle hint
    pub max_idle_usecs: u32,
    /// Scale-down timer period
    pub timer_interval_ms: u64,
    /// Scale down when sleep time / period reaches this
    pub sleep_ratio_threshold: f64,
    /// First pending-descriptor offset
    pub batch_1: u16,
    /// Second pending-descriptor offset
    pub batch_2: u16,
    /// Pending descriptor here means maximum frequency
    pub batch_3: u16,
    /// Trend weight at `batch_1`
    pub trend_batch_1: u32,
    /// Trend weight at `batch_2`
    pub trend_batch_2: u32,
    /// Trend above this scales up
    pub trend_freq_up: u32,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            scaling: false,
            interrupts: true,
            zero_rx_min: 100,
            sleep_base_usecs: 1,
            busy_wait_max_usecs: 50,
            suspend_usecs: 300,
            max_idle_usecs: 1000,
            timer_interval_ms: 10,
            sleep_ratio_threshold: 0.25,
            batch_1: 8,
            batch_2: 16,
            batch_3: 24,
            trend_batch_1: 1,
            trend_batch_2: 100,
            trend_freq_up: 10000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config = SensorConfig::from_json(
            r#"{
                "ports": [{"interface": "eth1"}],
                "scheduler": {"burst_size": 64},
                "power": {"zero_rx_min": 50}
            }"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.burst_size, 64);
        assert_eq!(config.scheduler.tx_drain_usecs, 100);
        assert_eq!(config.power.zero_rx_min, 50);
        assert_eq!(config.power.suspend_usecs, 300);
        assert!(config.ports[0].promiscuous);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_chain_entries_stay_raw() {
        let config = SensorConfig::from_json(
            r#"{
                "ports": [{"interface": "eth0", "mac": "02:00:00:00:00:01"}],
                "pcap_chain": [{"name": "web", "filter": "tcp port 80"}, 42]
            }"#,
        )
        .unwrap();

        assert_eq!(config.pcap_chain.len(), 2);
        assert_eq!(config.ports[0].mac.unwrap().to_string(), "02:00:00:00:00:01");
    }

    #[test]
    fn test_validate_rejects() {
        assert!(SensorConfig::from_json(r#"{"ports": []}"#).is_err());
        assert!(SensorConfig::from_json(
            r#"{"ports": [{"interface": "a"}], "scheduler": {"burst_size": 0}}"#
        )
        .is_err());
        assert!(SensorConfig::from_json(
            r#"{"ports": [{"interface": "a"}], "power": {"batch_1": 20, "batch_2": 16}}"#
        )
        .is_err());
        assert!(SensorConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = SensorConfig::load("/nonexistent/sensor.json").unwrap_err();
        assert!(matches!(err, SensorError::IoError(_)));
    }
}
