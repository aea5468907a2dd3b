//! Probe scheduler: the single worker that drives probing.
//!
//! Owns every network instance status and the device port snapshot. Each
//! tick pings the next-hop of every free port, probes remote hosts every Nth
//! tick, feeds the outcomes through the hysteresis engine, reselects each
//! instance's uplink and publishes what changed. Topology events are
//! handled on the same task, between ticks.
//!
//! # Signals
//!
//! After a tick in which some instance changed uplink or uplink health (or
//! ran for the first time), one [`UplinkSignal`] is published on a watch
//! channel. Sending never waits for receivers.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use uplink_state::{IfName, InstanceId, NetworkInstanceConfig, NetworkInstanceStatus, StatusStore};

use crate::hysteresis::{ProbeKind, apply_probe_result};
use crate::local::{LocalProbe, LocalProber, Pinger};
use crate::remote::{HttpProbe, RemoteProbeCache, RemoteProber, resolve_target};
use crate::selector::select_uplink;
use crate::settings::{ProbeSettings, Thresholds};
use crate::sync::{SyncOutcome, TopologySync, mark_present};
use crate::topology::{DevicePort, PortSnapshot};

/// Event delivered to the scheduler by the topology owners.
#[derive(Debug, Clone)]
pub enum TopologyEvent {
    /// The device port list was replaced.
    DevicePortsChanged(Vec<DevicePort>),
    /// A network instance was created or its configuration changed.
    InstanceChanged(NetworkInstanceConfig),
    /// A network instance was deleted.
    InstanceRemoved(InstanceId),
}

/// Aggregate "uplink changed" notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UplinkSignal {
    /// Incremented on every signal; 0 means nothing was signaled yet.
    pub generation: u64,
    /// Instances whose uplink or uplink health changed in that tick.
    pub instances: Vec<InstanceId>,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Iteration number of this tick, starting at 0.
    pub iteration: u64,
    /// Whether remote probes ran for at least one instance.
    pub remote_probed: bool,
    /// Instances included in the signal raised by this tick.
    pub signaled: Vec<InstanceId>,
}

/// Single-task probe scheduler.
pub struct ProbeScheduler {
    settings: ProbeSettings,
    thresholds: Thresholds,
    default_target: String,
    local: LocalProber,
    remote: RemoteProber,
    store: StatusStore,
    ports: PortSnapshot,
    instances: BTreeMap<InstanceId, NetworkInstanceStatus>,
    sync: TopologySync,
    iteration: u64,
    last_remote_target: Option<String>,
    signal_tx: watch::Sender<UplinkSignal>,
}

impl ProbeScheduler {
    /// Create a scheduler probing with the given capabilities.
    ///
    /// The default remote target starts as `settings.fallback_server`; use
    /// [`with_default_target`](Self::with_default_target) to set the one
    /// resolved at startup.
    pub fn new(
        settings: ProbeSettings,
        store: StatusStore,
        pinger: Arc<dyn Pinger>,
        http: Arc<dyn HttpProbe>,
    ) -> Self {
        let (signal_tx, _) = watch::channel(UplinkSignal::default());
        Self {
            thresholds: settings.thresholds(),
            default_target: settings.fallback_server.clone(),
            local: LocalProber::new(pinger, settings.local_timeout),
            remote: RemoteProber::new(http, settings.remote_timeout),
            sync: TopologySync::new(settings.rearm_cooldown),
            settings,
            store,
            ports: PortSnapshot::default(),
            instances: BTreeMap::new(),
            iteration: 0,
            last_remote_target: None,
            signal_tx,
        }
    }

    /// Set the process-wide default remote probe target.
    pub fn with_default_target(mut self, target: impl Into<String>) -> Self {
        self.default_target = target.into();
        self
    }

    /// Subscribe to uplink change signals.
    pub fn subscribe(&self) -> watch::Receiver<UplinkSignal> {
        self.signal_tx.subscribe()
    }

    pub fn instance(&self, id: &str) -> Option<&NetworkInstanceStatus> {
        self.instances.get(id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &NetworkInstanceStatus> {
        self.instances.values()
    }

    pub fn ports(&self) -> &PortSnapshot {
        &self.ports
    }

    /// Number of ticks run so far.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Apply a topology event.
    pub fn handle_event(&mut self, event: TopologyEvent) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        match event {
            TopologyEvent::DevicePortsChanged(ports) => {
                info!(ports = ports.len(), "device ports changed");
                self.ports = PortSnapshot::new(ports);
                for status in self.instances.values_mut() {
                    let synced = self.sync.sync_instance(status, &self.ports);
                    if synced.assigned {
                        publish(&self.store, status);
                    }
                    outcome.merge(synced);
                }
            }
            TopologyEvent::InstanceChanged(config) => {
                let status = match self.instances.entry(config.id.clone()) {
                    Entry::Occupied(entry) => {
                        let status = entry.into_mut();
                        debug!(id = %status.id, bridge = %config.bridge_name, "instance config updated");
                        status.apply_config(config);
                        status
                    }
                    Entry::Vacant(entry) => {
                        info!(id = %config.id, bridge = %config.bridge_name, port = %config.port, "instance added");
                        entry.insert(NetworkInstanceStatus::new(config))
                    }
                };
                outcome = self.sync.sync_instance(status, &self.ports);
                if outcome.assigned {
                    publish(&self.store, status);
                }
            }
            TopologyEvent::InstanceRemoved(id) => {
                if self.instances.remove(&id).is_some() {
                    info!(%id, "instance removed");
                }
                if let Err(e) = self.store.delete_instance_status(&id) {
                    error!(%id, error = %e, "failed to delete instance status");
                }
            }
        }
        outcome
    }

    /// Run one probe tick over every instance.
    pub async fn tick(&mut self) -> TickReport {
        let iteration = self.iteration;
        self.iteration += 1;

        let mut report = TickReport {
            iteration,
            ..TickReport::default()
        };
        let mut local_results: HashMap<IfName, LocalProbe> = HashMap::new();
        let mut remote_cache = RemoteProbeCache::default();

        for status in self.instances.values_mut() {
            if !status.kind.is_probed() || status.error.is_some() {
                continue;
            }
            status.need_intf_update = false;
            mark_present(status, &self.ports);

            let if_names: Vec<IfName> = status
                .pinfo
                .values()
                .filter(|i| i.is_present)
                .map(|i| i.if_name.clone())
                .collect();
            let mut state_changed = false;

            for if_name in &if_names {
                let Some(info) = status.pinfo.get_mut(if_name) else {
                    continue;
                };
                if !info.is_free() {
                    continue;
                }
                let result = match local_results.get(if_name) {
                    Some(result) => *result,
                    None => {
                        let result = self.local.probe(info).await;
                        local_results.insert(if_name.clone(), result);
                        result
                    }
                };
                if result.force_down && (info.gateway_up || info.remote_host_up) {
                    warn!(bridge = %status.bridge_name, intf = %if_name, "no local address, forcing port down");
                    info.gateway_up = false;
                    info.remote_host_up = false;
                    state_changed = true;
                }
                state_changed |= apply_probe_result(
                    info,
                    ProbeKind::Local,
                    result.reachable,
                    0,
                    &self.thresholds,
                );
            }

            let ratio = self.settings.remote_ratio_for(status.probe.probe_interval);
            if iteration % u64::from(ratio) == 0 {
                report.remote_probed = true;
                let target = resolve_target(&status.probe, &self.default_target);
                if self.last_remote_target.as_deref() != Some(target.as_str()) {
                    debug!(bridge = %status.bridge_name, %target, "remote probe target");
                    self.last_remote_target = Some(target.clone());
                }
                for if_name in &if_names {
                    let res = self
                        .remote
                        .probe_cached(&mut remote_cache, if_name, &target, &self.ports)
                        .await;
                    if let Some(info) = status.pinfo.get_mut(if_name) {
                        state_changed |= apply_probe_result(
                            info,
                            ProbeKind::Remote,
                            res.is_remote_reply,
                            res.latency_ms,
                            &self.thresholds,
                        );
                    }
                }
            }

            select_uplink(status);

            let first = status.trigger_cnt == 0;
            if status.need_intf_update || first {
                status.trigger_cnt = status.trigger_cnt.saturating_add(1);
                report.signaled.push(status.id.clone());
            }
            if state_changed || status.need_intf_update || first {
                publish(&self.store, status);
            }
        }

        if !report.signaled.is_empty() {
            let generation = self.signal_tx.borrow().generation + 1;
            info!(
                generation,
                instances = ?report.signaled,
                "uplink change signaled"
            );
            self.signal_tx.send_replace(UplinkSignal {
                generation,
                instances: report.signaled.clone(),
            });
        }
        debug!(iteration, remote = report.remote_probed, "probe tick done");
        report
    }

    /// Drive ticks and topology events until `shutdown` fires.
    ///
    /// The timer is re-armed after each tick completes; an honored urgent
    /// re-arm pulls the next tick forward.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<TopologyEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval = ?self.settings.interval,
            target = %self.default_target,
            "probe scheduler started"
        );
        let mut deadline = Instant::now() + self.settings.interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    self.tick().await;
                    deadline = Instant::now() + self.settings.interval;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("topology event channel closed, stopping scheduler");
                        break;
                    };
                    if self.handle_event(event).rearm {
                        deadline = deadline.min(Instant::now() + self.settings.urgent_interval);
                    }
                }
                _ = shutdown.changed() => {
                    info!("probe scheduler shutting down");
                    break;
                }
            }
        }
    }
}

fn publish(store: &StatusStore, status: &mut NetworkInstanceStatus) {
    status.updated_at = epoch_secs();
    if let Err(e) = store.put_instance_status(status) {
        error!(id = %status.id, bridge = %status.bridge_name, error = %e, "failed to publish instance status");
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
