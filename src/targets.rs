use crate::config::TargetConfig;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::SystemTime;

/// A packet source the probe expects to hear from.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(dead_code)]
pub struct Endpoint {
    pub name: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub labels: BTreeMap<String, String>,
    pub last_updated: SystemTime,
}

impl Endpoint {
    #[cfg(test)]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: None,
            port: 0,
            labels: BTreeMap::new(),
            last_updated: SystemTime::now(),
        }
    }
}

/// Source of the current target list. Consulted once per output tick.
pub trait TargetProvider: Send + Sync {
    fn list_endpoints(&self) -> Vec<Endpoint>;
}

/// Fixed target list taken from the config file.
pub struct StaticTargets {
    endpoints: Vec<Endpoint>,
}

impl StaticTargets {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }

    pub fn from_config(targets: &[TargetConfig]) -> Self {
        let now = SystemTime::now();
        let endpoints = targets
            .iter()
            .map(|t| Endpoint {
                name: t.name.clone(),
                ip: t.ip,
                port: t.port,
                labels: t.labels.clone(),
                last_updated: now,
            })
            .collect();
        Self { endpoints }
    }
}

impl TargetProvider for StaticTargets {
    fn list_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_targets_from_config() {
        let cfg = vec![
            TargetConfig {
                name: "sender-a".to_string(),
                ip: Some("10.0.0.1".parse().unwrap()),
                port: 31122,
                labels: BTreeMap::from([("zone".to_string(), "a".to_string())]),
            },
            TargetConfig {
                name: "sender-b".to_string(),
                ip: None,
                port: 0,
                labels: BTreeMap::new(),
            },
        ];

        let targets = StaticTargets::from_config(&cfg).list_endpoints();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "sender-a");
        assert_eq!(targets[0].ip, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(targets[0].labels["zone"], "a");
        assert!(targets[1].ip.is_none());
    }
}
