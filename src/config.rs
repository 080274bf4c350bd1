use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub probe: ProbeConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    /// Count packets only.
    #[default]
    Discard,
    /// Count packets and write each one back to its sender.
    Echo,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub port: u16,
    pub source_ip: Option<IpAddr>,
    #[serde(default)]
    pub mode: ProbeMode,
    #[serde(default = "default_packets_per_probe")]
    pub packets_per_probe: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_stats_export_interval_ms")]
    pub stats_export_interval_ms: u64,
    #[serde(default = "default_max_targets")]
    pub max_targets: usize,
    // Defaults to max_targets
    pub max_sources: Option<usize>,
    #[serde(default = "default_read_deadline_ms")]
    pub read_deadline_ms: u64,
    #[serde(default = "default_log_throttle_threshold")]
    pub log_throttle_threshold: u32,
    #[serde(default)]
    pub additional_labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    pub name: String,
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_name() -> String {
    "udp_listener".to_string()
}
fn default_packets_per_probe() -> u32 {
    1
}
fn default_interval_ms() -> u64 {
    2000
}
fn default_stats_export_interval_ms() -> u64 {
    10_000
}
fn default_max_targets() -> usize {
    1024
}
fn default_read_deadline_ms() -> u64 {
    1000
}
fn default_log_throttle_threshold() -> u32 {
    10
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stats_export_interval(&self) -> Duration {
        Duration::from_millis(self.stats_export_interval_ms)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_millis(self.read_deadline_ms)
    }

    pub fn max_sources(&self) -> usize {
        self.max_sources.unwrap_or(self.max_targets)
    }

    pub fn echo_mode(&self) -> bool {
        self.mode == ProbeMode::Echo
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid("interval_ms must be > 0".into()));
        }
        if self.packets_per_probe == 0 {
            return Err(ConfigError::Invalid("packets_per_probe must be >= 1".into()));
        }
        if self.stats_export_interval_ms < self.interval_ms {
            return Err(ConfigError::Invalid(format!(
                "stats_export_interval_ms ({}) is shorter than interval_ms ({})",
                self.stats_export_interval_ms, self.interval_ms
            )));
        }
        if self.max_targets == 0 || self.max_sources() == 0 {
            return Err(ConfigError::Invalid(
                "max_targets and max_sources must be >= 1".into(),
            ));
        }
        if self.read_deadline_ms == 0 {
            return Err(ConfigError::Invalid("read_deadline_ms must be > 0".into()));
        }
        if self.log_throttle_threshold == 0 {
            return Err(ConfigError::Invalid(
                "log_throttle_threshold must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.probe.validate()?;

        let mut seen = HashSet::new();
        for t in &self.targets {
            if t.name.is_empty() {
                return Err(ConfigError::Invalid("target with empty name".into()));
            }
            if !seen.insert(t.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target '{}'",
                    t.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
