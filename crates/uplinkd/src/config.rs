//! uplinkd.toml configuration.
//!
//! ```toml
//! [probe]
//! interval = "15s"
//!
//! [store]
//! path = "/var/lib/uplinkd/status.redb"
//!
//! [[ports]]
//! name = "eth0"
//! if_name = "eth0"
//! gateway = "192.168.1.1"
//! subnet = "192.168.1.0/24"
//! addrs = ["192.168.1.20"]
//!
//! [[instances]]
//! id = "ni-1"
//! bridge_name = "bn1"
//! type = "local"
//! port = "uplink"
//!
//! [instances.probe]
//! server_url = "probe.example.net"
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use uplink_health::{DevicePort, ProbeSettings, TopologyEvent};
use uplink_state::{InstanceId, NetworkInstanceConfig};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/uplinkd/uplinkd.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub probe: ProbeSettings,
    pub store: StoreConfig,
    pub ports: Vec<DevicePort>,
    pub instances: Vec<NetworkInstanceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/uplinkd/status.redb"),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.probe.interval.is_zero() {
            return Err(ConfigError::Invalid("probe.interval must be positive".into()));
        }
        if self.probe.remote_ratio == 0 {
            return Err(ConfigError::Invalid("probe.remote_ratio must be positive".into()));
        }
        let mut ids = BTreeSet::new();
        for inst in &self.instances {
            if inst.id.trim().is_empty() {
                return Err(ConfigError::Invalid("instance with empty id".into()));
            }
            if !ids.insert(inst.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate instance id {:?}", inst.id)));
            }
        }
        Ok(())
    }

    /// Events that bring a scheduler in line with this configuration.
    pub fn topology_events(&self) -> Vec<TopologyEvent> {
        let mut events = Vec::with_capacity(self.instances.len() + 1);
        events.push(TopologyEvent::DevicePortsChanged(self.ports.clone()));
        events.extend(self.instances.iter().cloned().map(TopologyEvent::InstanceChanged));
        events
    }

    /// Instances present in `previous` but not in `self`.
    pub fn removed_instances(&self, previous: &DaemonConfig) -> Vec<InstanceId> {
        let current: BTreeSet<&str> = self.instances.iter().map(|i| i.id.as_str()).collect();
        previous
            .instances
            .iter()
            .filter(|i| !current.contains(i.id.as_str()))
            .map(|i| i.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uplink_state::InstanceType;

    const SAMPLE: &str = r#"
[probe]
interval = "30s"
server_file = "/tmp/none"

[store]
path = "/tmp/uplinkd-test.redb"

[[ports]]
name = "eth0"
if_name = "eth0"
gateway = "192.168.1.1"
subnet = "192.168.1.0/24"
addrs = ["192.168.1.20"]

[[ports]]
name = "lte"
if_name = "wwan0"
free = false

[[instances]]
id = "ni-1"
bridge_name = "bn1"
type = "local"
port = "uplink"

[instances.probe]
server_url = "probe.example.net"
probe_interval = 300

[[instances]]
id = "ni-2"
bridge_name = "bn2"
type = "cloud"
port = "eth0"
"#;

    fn parse(content: &str) -> Result<DaemonConfig, ConfigError> {
        DaemonConfig::parse(content, Path::new("test.toml"))
    }

    #[test]
    fn parses_full_config() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.probe.interval, Duration::from_secs(30));
        assert_eq!(config.store.path, PathBuf::from("/tmp/uplinkd-test.redb"));

        assert_eq!(config.ports.len(), 2);
        let eth0 = &config.ports[0];
        assert!(eth0.is_mgmt && eth0.free);
        assert_eq!(eth0.local_addr(), Some("192.168.1.20".parse().unwrap()));
        assert!(!config.ports[1].free);

        assert_eq!(config.instances.len(), 2);
        let ni1 = &config.instances[0];
        assert_eq!(ni1.kind, InstanceType::Local);
        assert_eq!(ni1.probe.server_url.as_deref(), Some("probe.example.net"));
        assert_eq!(ni1.probe.probe_interval, 300);
        assert_eq!(config.instances[1].kind, InstanceType::Cloud);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.probe.interval, Duration::from_secs(15));
        assert_eq!(config.store.path, PathBuf::from("/var/lib/uplinkd/status.redb"));
        assert!(config.ports.is_empty());
        assert!(config.instances.is_empty());
    }

    #[test]
    fn rejects_duplicate_instance_ids() {
        let content = r#"
[[instances]]
id = "ni-1"
bridge_name = "bn1"
type = "local"
port = "eth0"

[[instances]]
id = "ni-1"
bridge_name = "bn2"
type = "local"
port = "eth1"
"#;
        assert!(matches!(parse(content), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            parse("[probe]\ninterval = \"0s\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse("[[ports]]\nname = \"eth0\"\nsubnet = \"not-a-subnet\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn events_deliver_ports_before_instances() {
        let config = parse(SAMPLE).unwrap();
        let events = config.topology_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], TopologyEvent::DevicePortsChanged(ports) if ports.len() == 2));
        assert!(matches!(&events[1], TopologyEvent::InstanceChanged(c) if c.id == "ni-1"));
        assert!(matches!(&events[2], TopologyEvent::InstanceChanged(c) if c.id == "ni-2"));
    }

    #[test]
    fn reload_reports_removed_instances() {
        let before = parse(SAMPLE).unwrap();
        let mut after = before.clone();
        after.instances.retain(|i| i.id != "ni-2");
        assert_eq!(after.removed_instances(&before), vec!["ni-2".to_string()]);
        assert!(before.removed_instances(&after).is_empty());
    }

    #[test]
    fn from_file_reads_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uplinkd.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(DaemonConfig::from_file(&path).unwrap().instances.len(), 2);

        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            DaemonConfig::from_file(&missing),
            Err(ConfigError::Read { .. })
        ));
    }
}
