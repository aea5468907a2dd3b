//! Topology sync: keeps per-instance probe entries in line with device ports.
//!
//! Runs on the scheduler task, so it never races a tick. Creates probe
//! entries for newly associated ports, refreshes next-hop, local address
//! and cost tier of known ones, and asks for an urgent re-probe when the
//! active port loses or gains its local address.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use uplink_state::{CostTier, NetworkInstanceStatus, ProbeInfo};

use crate::topology::{DevicePort, PortSnapshot, is_unset};

/// What a sync pass asks of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncOutcome {
    /// Re-arm the tick timer with the urgent interval.
    pub rearm: bool,
    /// At least one instance got an uplink assigned and should be published.
    pub assigned: bool,
}

impl SyncOutcome {
    pub fn merge(&mut self, other: SyncOutcome) {
        self.rearm |= other.rearm;
        self.assigned |= other.assigned;
    }
}

/// Applies topology events to network instance probe state.
#[derive(Debug)]
pub struct TopologySync {
    cooldown: Duration,
    /// When the last urgent re-arm was honored.
    last_rearm: Option<Instant>,
}

impl TopologySync {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_rearm: None,
        }
    }

    /// Sync a single instance against the current port set.
    pub fn sync_instance(
        &mut self,
        status: &mut NetworkInstanceStatus,
        ports: &PortSnapshot,
    ) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        if let Some(err) = &status.error {
            debug!(bridge = %status.bridge_name, error = %err, "instance in error, not probing");
            return outcome;
        }
        if !status.kind.is_probed() {
            return outcome;
        }

        let label = status.port.clone();
        let mut addr_changed = false;
        for port in ports.ports_for_label(&label) {
            if port.if_name.is_empty() {
                debug!(bridge = %status.bridge_name, port = %port.name, "port without interface, skipping");
                continue;
            }
            addr_changed |= update_port(status, port);
        }

        if addr_changed {
            outcome.rearm = self.request_rearm(&status.bridge_name);
        }
        outcome.assigned = assign_initial_uplink(status, ports);
        outcome
    }

    /// Honor an urgent re-arm unless one was honored within the cool-down.
    pub fn request_rearm(&mut self, bridge: &str) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_rearm {
            let since = now.duration_since(last);
            if since < self.cooldown {
                debug!(%bridge, ?since, "urgent re-arm suppressed");
                return false;
            }
        }
        info!(%bridge, "local address changed on active port, re-probing soon");
        self.last_rearm = Some(now);
        true
    }
}

/// Create or refresh the probe entry for `port`.
///
/// Returns true if the port is the instance's active one and its local
/// address was lost or gained.
fn update_port(status: &mut NetworkInstanceStatus, port: &DevicePort) -> bool {
    let local_addr = port.local_addr();
    let tier = CostTier::from_free(port.free);
    let active = status.current_uplink_intf.as_deref() == Some(port.if_name.as_str())
        || status.port == port.name;

    match status.pinfo.get_mut(&port.if_name) {
        Some(info) => {
            let had_addr = !is_unset(info.local_addr);
            let has_addr = !is_unset(local_addr);
            info.nh_addr = port.gateway;
            info.local_addr = local_addr;
            info.tier = tier;
            info.is_present = true;
            active && had_addr != has_addr
        }
        None => {
            info!(
                bridge = %status.bridge_name,
                intf = %port.if_name,
                ?tier,
                nh = ?port.gateway,
                local = ?local_addr,
                "probing new port"
            );
            status.pinfo.insert(
                port.if_name.clone(),
                ProbeInfo::new(port.if_name.clone(), port.gateway, local_addr, tier),
            );
            false
        }
    }
}

/// Give an instance without a valid uplink its first one.
///
/// Prefers the first port (by name) with a usable unicast address, then one
/// with any address, then simply the first entry.
pub fn assign_initial_uplink(status: &mut NetworkInstanceStatus, ports: &PortSnapshot) -> bool {
    if status.current_info().is_some() || status.pinfo.is_empty() {
        return false;
    }

    let port_of = |name: &str| ports.port_by_if_name(name);
    let pick = status
        .pinfo
        .keys()
        .find(|name| port_of(name).and_then(DevicePort::usable_addr).is_some())
        .or_else(|| {
            status
                .pinfo
                .keys()
                .find(|name| port_of(name).is_some_and(|p| !p.addrs.is_empty()))
        })
        .or_else(|| status.pinfo.keys().next())
        .cloned();

    let Some(pick) = pick else {
        return false;
    };
    info!(bridge = %status.bridge_name, intf = %pick, "initial uplink assigned");
    status.current_uplink_intf = Some(pick);
    true
}

/// Re-mark as present every entry whose interface the instance still
/// references in `ports`.
pub fn mark_present(status: &mut NetworkInstanceStatus, ports: &PortSnapshot) {
    for if_name in ports.if_names_for_label(&status.port) {
        if let Some(info) = status.pinfo.get_mut(&if_name) {
            info.is_present = true;
        }
    }
}
