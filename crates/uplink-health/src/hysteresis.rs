//! Hysteresis engine: turns raw probe outcomes into UP/DOWN verdicts.
//!
//! A verdict only flips after a streak of consistent outcomes, with two
//! shortcuts:
//!
//! - **Fast convergence**: after a long outage the very first local success
//!   restores the gateway verdict.
//! - **Cascade**: when the gateway starts failing after a long healthy
//!   period, the next failed remote probe takes the remote verdict down
//!   without waiting for the remote streak.

use tracing::debug;

use uplink_state::ProbeInfo;

use crate::settings::Thresholds;

/// Which health signal a probe outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Next-hop reachability.
    Local,
    /// Remote host reachability.
    Remote,
}

/// Feed one probe outcome into `info`.
///
/// Returns true if `gateway_up` or `remote_host_up` flipped.
pub fn apply_probe_result(
    info: &mut ProbeInfo,
    kind: ProbeKind,
    got_reply: bool,
    latency_ms: u64,
    thresholds: &Thresholds,
) -> bool {
    match kind {
        ProbeKind::Local => apply_local(info, got_reply, thresholds),
        ProbeKind::Remote => apply_remote(info, got_reply, latency_ms, thresholds),
    }
}

fn apply_local(info: &mut ProbeInfo, got_reply: bool, t: &Thresholds) -> bool {
    let mut changed = false;
    debug!(
        intf = %info.if_name,
        gateway_up = info.gateway_up,
        success = info.success_cnt,
        failed = info.failed_cnt,
        got_reply,
        "local probe result"
    );

    if got_reply {
        if !info.gateway_up && info.success_cnt == 0 && info.failed_cnt > t.stay_down_min {
            info.gateway_up = true;
            changed = true;
            debug!(
                intf = %info.if_name,
                failed = info.failed_cnt,
                "gateway back after long outage, fast convergence"
            );
        }
        info.success_cnt = info.success_cnt.saturating_add(1);
        info.failed_cnt = 0;
        info.trans_down = false;
    } else {
        if info.gateway_up && info.failed_cnt == 0 && info.success_cnt > t.stay_up_min {
            info.trans_down = true;
        }
        info.failed_cnt = info.failed_cnt.saturating_add(1);
        info.success_cnt = 0;
    }

    if info.failed_cnt > t.max_fail && info.gateway_up {
        info.gateway_up = false;
        changed = true;
    } else if info.success_cnt > t.max_success && !info.gateway_up {
        info.gateway_up = true;
        changed = true;
    }
    changed
}

fn apply_remote(info: &mut ProbeInfo, got_reply: bool, latency_ms: u64, t: &Thresholds) -> bool {
    let mut changed = false;
    debug!(
        intf = %info.if_name,
        remote_up = info.remote_host_up,
        success = info.success_probe_cnt,
        failed = info.failed_probe_cnt,
        got_reply,
        "remote probe result"
    );

    if got_reply {
        let total = info.ave_latency_ms * u64::from(info.success_probe_cnt);
        info.success_probe_cnt = info.success_probe_cnt.saturating_add(1);
        info.ave_latency_ms = (total + latency_ms) / u64::from(info.success_probe_cnt);
        info.failed_probe_cnt = 0;
    } else {
        // A gateway that just went down drags the remote verdict with it.
        if info.trans_down && !info.gateway_up && info.remote_host_up && info.failed_probe_cnt < 2
        {
            info.remote_host_up = false;
            info.trans_down = false;
            changed = true;
        }
        info.failed_probe_cnt = info.failed_probe_cnt.saturating_add(1);
        info.success_probe_cnt = 0;
        info.ave_latency_ms = 0;
    }

    if info.failed_probe_cnt > t.max_fail && info.remote_host_up {
        info.remote_host_up = false;
        changed = true;
    } else if info.success_probe_cnt > t.max_success && !info.remote_host_up {
        info.remote_host_up = true;
        changed = true;
    }
    changed
}
