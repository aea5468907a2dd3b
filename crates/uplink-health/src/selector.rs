//! Uplink selector: picks the active uplink of a network instance.
//!
//! Free ports always win over non-free ports as long as one of them is at
//! least partially healthy. Within a tier, the current uplink is only
//! replaced by a strictly healthier port.

use tracing::{info, warn};

use uplink_state::{CostTier, CurrIntfStatus, IfName, NetworkInstanceStatus};

/// Run one selection pass over `status`.
///
/// Drops entries not re-marked present since the previous pass, then
/// updates `current_uplink_intf`, `prev_uplink_intf` and `curr_intf_up`.
/// `need_intf_update` is set when the uplink or its health changed; it is
/// never cleared here.
pub fn select_uplink(status: &mut NetworkInstanceStatus) {
    let bridge = status.bridge_name.clone();

    status.pinfo.retain(|name, info| {
        if !info.is_present {
            info!(%bridge, intf = %name, "port gone, dropping probe info");
            return false;
        }
        info.is_present = false;
        true
    });

    let prev = status.current_uplink_intf.clone();
    let mut current: Option<IfName> = prev.clone();

    for tier in [CostTier::Free, CostTier::NonFree] {
        let seed_name = match &current {
            Some(name) => name.clone(),
            None => match status.pinfo.values().find(|i| i.tier == tier) {
                Some(first) => first.if_name.clone(),
                None => continue,
            },
        };
        let Some(seed_info) = status.pinfo.get(&seed_name) else {
            warn!(%bridge, intf = %seed_name, "current uplink has no probe info, clearing");
            current = None;
            break;
        };

        let mut seed = seed_name;
        let mut seed_up = seed_info.up_count();
        let mut seed_tier = seed_info.tier;

        if tier == CostTier::Free && seed_tier == CostTier::NonFree {
            if let Some(free) = status
                .pinfo
                .values()
                .find(|i| i.is_free() && i.up_count() > 0)
            {
                seed = free.if_name.clone();
                seed_up = free.up_count();
                seed_tier = CostTier::Free;
            }
        }

        if seed_tier != tier || seed_up < 2 {
            for candidate in status.pinfo.values().filter(|i| i.tier == tier) {
                if candidate.up_count() > seed_up {
                    seed = candidate.if_name.clone();
                    seed_up = candidate.up_count();
                }
            }
        }

        current = Some(seed);
        if seed_up > 0 {
            break;
        }
    }

    status.current_uplink_intf = current;
    if status.current_uplink_intf != prev {
        info!(
            %bridge,
            from = prev.as_deref().unwrap_or("-"),
            to = status.current_uplink_intf.as_deref().unwrap_or("-"),
            "uplink changed"
        );
        status.prev_uplink_intf = prev;
        status.need_intf_update = true;
    }

    let up = match status.current_info() {
        Some(i) if i.up_count() > 0 => CurrIntfStatus::Up,
        Some(_) => CurrIntfStatus::Down,
        None => CurrIntfStatus::None,
    };
    if up != status.curr_intf_up {
        info!(%bridge, from = ?status.curr_intf_up, to = ?up, "uplink health changed");
        status.curr_intf_up = up;
        status.need_intf_update = true;
    }
}
