//! Domain types for uplink probing.
//!
//! These types represent the probe state of every candidate uplink port and
//! the uplink selection of every network instance. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Unique identifier for a network instance.
pub type InstanceId = String;

/// Interface name of a candidate uplink port (e.g. `eth0`, `wwan0`).
pub type IfName = String;

// ── Probe info ────────────────────────────────────────────────────

/// Cost classification of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    /// Unmetered (Ethernet, Wi-Fi). Always preferred while healthy.
    Free,
    /// Metered (cellular, satellite).
    NonFree,
}

impl CostTier {
    pub fn from_free(free: bool) -> Self {
        if free { CostTier::Free } else { CostTier::NonFree }
    }
}

/// Health record of one candidate port within one network instance.
///
/// The success/failure counters come in mutually exclusive pairs: bumping
/// one side always zeroes the other.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeInfo {
    pub if_name: IfName,
    /// Re-marked by topology sync, cleared by each selector pass.
    pub is_present: bool,
    /// Local next-hop (gateway) address.
    pub nh_addr: Option<IpAddr>,
    /// Source address used for probing out of this port.
    pub local_addr: Option<IpAddr>,
    pub tier: CostTier,

    // Local next-hop health.
    pub gateway_up: bool,
    pub success_cnt: u32,
    pub failed_cnt: u32,
    /// The gateway just started failing after a long healthy period.
    pub trans_down: bool,

    // Remote host health.
    pub remote_host_up: bool,
    pub success_probe_cnt: u32,
    pub failed_probe_cnt: u32,
    /// Mean remote latency (ms) over the current success streak.
    pub ave_latency_ms: u64,
}

impl ProbeInfo {
    /// A freshly discovered port. Both verdicts start out up.
    pub fn new(
        if_name: impl Into<IfName>,
        nh_addr: Option<IpAddr>,
        local_addr: Option<IpAddr>,
        tier: CostTier,
    ) -> Self {
        Self {
            if_name: if_name.into(),
            is_present: true,
            nh_addr,
            local_addr,
            tier,
            gateway_up: true,
            success_cnt: 0,
            failed_cnt: 0,
            trans_down: false,
            remote_host_up: true,
            success_probe_cnt: 0,
            failed_probe_cnt: 0,
            ave_latency_ms: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.tier == CostTier::Free
    }

    /// 2 when both verdicts are up, 1 when exactly one is, 0 otherwise.
    pub fn up_count(&self) -> u8 {
        u8::from(self.gateway_up) + u8::from(self.remote_host_up)
    }
}

// ── Network instance ──────────────────────────────────────────────

/// Kind of network instance. Only `Local` and `Cloud` are probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceType {
    Switch,
    Local,
    Cloud,
    Mesh,
}

impl InstanceType {
    pub fn is_probed(self) -> bool {
        matches!(self, InstanceType::Local | InstanceType::Cloud)
    }
}

/// User overrides for remote probing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Remote server URL, with or without a scheme.
    #[serde(default)]
    pub server_url: Option<String>,
    /// Remote server IP, used when no URL is given.
    #[serde(default)]
    pub server_ip: Option<IpAddr>,
    /// Remote probe interval in seconds (0 = default cadence).
    #[serde(default)]
    pub probe_interval: u32,
}

/// Status of the selected uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrIntfStatus {
    #[default]
    None,
    Up,
    Down,
}

/// Configuration of a network instance as delivered by its lifecycle owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkInstanceConfig {
    pub id: InstanceId,
    pub bridge_name: String,
    #[serde(rename = "type")]
    pub kind: InstanceType,
    /// Port label: an interface name, or a shared label such as `uplink`.
    pub port: String,
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Set when the instance failed to come up; such instances are not probed.
    #[serde(default)]
    pub error: Option<String>,
}

/// Uplink probing status of one network instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkInstanceStatus {
    pub id: InstanceId,
    pub bridge_name: String,
    pub kind: InstanceType,
    pub port: String,
    pub probe: ProbeConfig,
    pub error: Option<String>,
    /// Candidate ports keyed by interface name.
    pub pinfo: BTreeMap<IfName, ProbeInfo>,
    pub current_uplink_intf: Option<IfName>,
    pub prev_uplink_intf: Option<IfName>,
    pub curr_intf_up: CurrIntfStatus,
    /// Set when the uplink or its health changed during the current tick.
    pub need_intf_update: bool,
    /// Number of uplink signals ever raised for this instance.
    pub trigger_cnt: u32,
    /// Unix timestamp of the last publish.
    pub updated_at: u64,
}

impl NetworkInstanceStatus {
    /// Build an empty status for a newly configured instance.
    pub fn new(config: NetworkInstanceConfig) -> Self {
        Self {
            id: config.id,
            bridge_name: config.bridge_name,
            kind: config.kind,
            port: config.port,
            probe: config.probe,
            error: config.error,
            pinfo: BTreeMap::new(),
            current_uplink_intf: None,
            prev_uplink_intf: None,
            curr_intf_up: CurrIntfStatus::None,
            need_intf_update: false,
            trigger_cnt: 0,
            updated_at: 0,
        }
    }

    /// Replace the configuration fields, keeping all probe state.
    pub fn apply_config(&mut self, config: NetworkInstanceConfig) {
        self.bridge_name = config.bridge_name;
        self.kind = config.kind;
        self.port = config.port;
        self.probe = config.probe;
        self.error = config.error;
    }

    /// Probe info of the selected uplink, if any.
    pub fn current_info(&self) -> Option<&ProbeInfo> {
        self.current_uplink_intf
            .as_deref()
            .and_then(|name| self.pinfo.get(name))
    }
}
