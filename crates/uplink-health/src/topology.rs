//! Device port snapshot: the view of device ports the probe engine works from.
//!
//! The snapshot is replaced wholesale whenever the device reports a new
//! port set. It answers three questions: which interfaces a network
//! instance's port label expands to, which local address a port probes
//! from, and how to egress a remote probe out of a given interface.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

/// Port label matching every management port.
pub const LABEL_UPLINK: &str = "uplink";
/// Port label matching every free management port.
pub const LABEL_FREE_UPLINK: &str = "freeuplink";

/// Whether a port label is shared across several device ports.
pub fn is_shared_label(label: &str) -> bool {
    label.eq_ignore_ascii_case(LABEL_UPLINK) || label.eq_ignore_ascii_case(LABEL_FREE_UPLINK)
}

/// An IP prefix such as `192.168.1.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl Subnet {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask(self.prefix_len, 32) as u32;
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask(self.prefix_len, 128);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask(prefix_len: u8, bits: u32) -> u128 {
    let len = u32::from(prefix_len).min(bits);
    if len == 0 {
        return 0;
    }
    let all = if bits == 128 { u128::MAX } else { (1u128 << bits) - 1 };
    all & !((1u128 << (bits - len)) - 1)
}

/// Error returned when parsing a [`Subnet`] fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetParseError(String);

impl fmt::Display for SubnetParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid subnet: {}", self.0)
    }
}

impl std::error::Error for SubnetParseError {}

impl FromStr for Subnet {
    type Err = SubnetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || SubnetParseError(s.to_string());
        let (addr, len) = s.trim().split_once('/').ok_or_else(err)?;
        let addr: IpAddr = addr.parse().map_err(|_| err())?;
        let prefix_len: u8 = len.parse().map_err(|_| err())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(err());
        }
        Ok(Subnet { addr, prefix_len })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl<'de> Deserialize<'de> for Subnet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One device port as reported by the device network status.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DevicePort {
    /// Logical port name.
    pub name: String,
    /// Kernel interface name; empty for ports without a data-plane interface.
    #[serde(default)]
    pub if_name: String,
    /// Management ports are the uplink candidates.
    #[serde(default = "default_true")]
    pub is_mgmt: bool,
    #[serde(default = "default_true")]
    pub free: bool,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub subnet: Option<Subnet>,
    #[serde(default)]
    pub addrs: Vec<IpAddr>,
}

fn default_true() -> bool {
    true
}

impl DevicePort {
    /// Probe source address: the last assigned address inside the port subnet.
    pub fn local_addr(&self) -> Option<IpAddr> {
        let subnet = self.subnet?;
        self.addrs.iter().rev().find(|a| subnet.contains(a)).copied()
    }

    /// First unicast address that is not link-local.
    pub fn usable_addr(&self) -> Option<IpAddr> {
        self.addrs.iter().find(|a| is_usable_unicast(a)).copied()
    }
}

/// True for a specified, non-multicast, non-link-local address.
pub fn is_usable_unicast(ip: &IpAddr) -> bool {
    if ip.is_unspecified() || ip.is_multicast() || ip.is_loopback() {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => !v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}

/// True if an optional address is absent or unspecified.
pub fn is_unset(ip: Option<IpAddr>) -> bool {
    ip.is_none_or(|a| a.is_unspecified())
}

/// How a remote probe leaves the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Egress {
    pub if_name: String,
    /// Source address to bind, if the interface has one.
    pub local_addr: Option<IpAddr>,
}

/// Latest device port list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortSnapshot {
    ports: Vec<DevicePort>,
}

impl PortSnapshot {
    pub fn new(ports: Vec<DevicePort>) -> Self {
        Self { ports }
    }

    pub fn ports(&self) -> &[DevicePort] {
        &self.ports
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Find a port by interface name.
    pub fn port_by_if_name(&self, if_name: &str) -> Option<&DevicePort> {
        if if_name.is_empty() {
            return None;
        }
        self.ports.iter().find(|p| p.if_name == if_name)
    }

    /// Device ports a network instance port label refers to.
    pub fn ports_for_label<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a DevicePort> + 'a {
        self.ports.iter().filter(move |p| {
            if label.eq_ignore_ascii_case(LABEL_UPLINK) {
                p.is_mgmt
            } else if label.eq_ignore_ascii_case(LABEL_FREE_UPLINK) {
                p.is_mgmt && p.free
            } else {
                p.name == label || (!p.if_name.is_empty() && p.if_name == label)
            }
        })
    }

    /// Interface names a port label expands to.
    pub fn if_names_for_label(&self, label: &str) -> Vec<String> {
        self.ports_for_label(label)
            .filter(|p| !p.if_name.is_empty())
            .map(|p| p.if_name.clone())
            .collect()
    }

    /// Egress for remote probes out of `if_name`, if the device has that port.
    pub fn egress(&self, if_name: &str) -> Option<Egress> {
        let port = self.port_by_if_name(if_name)?;
        Some(Egress {
            if_name: port.if_name.clone(),
            local_addr: port.usable_addr().or_else(|| port.addrs.first().copied()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, if_name: &str, free: bool, addrs: &[&str]) -> DevicePort {
        DevicePort {
            name: name.to_string(),
            if_name: if_name.to_string(),
            is_mgmt: true,
            free,
            gateway: Some("10.0.0.1".parse().unwrap()),
            subnet: Some("10.0.0.0/24".parse().unwrap()),
            addrs: addrs.iter().map(|a| a.parse().unwrap()).collect(),
        }
    }

    #[test]
    fn subnet_contains() {
        let net: Subnet = "192.168.1.0/24".parse().unwrap();
        assert!(net.contains(&"192.168.1.77".parse().unwrap()));
        assert!(!net.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!net.contains(&"fe80::1".parse().unwrap()));

        let v6: Subnet = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains(&"2001:db8:1::5".parse().unwrap()));
        assert!(!v6.contains(&"2001:db9::5".parse().unwrap()));

        let any: Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn subnet_rejects_garbage() {
        assert!("10.0.0.0".parse::<Subnet>().is_err());
        assert!("10.0.0.0/33".parse::<Subnet>().is_err());
        assert!("host/8".parse::<Subnet>().is_err());
    }

    #[test]
    fn local_addr_is_last_in_subnet() {
        let p = port("eth0", "eth0", true, &["10.0.0.5", "172.16.0.1", "10.0.0.9"]);
        assert_eq!(p.local_addr(), Some("10.0.0.9".parse().unwrap()));

        let outside = port("eth0", "eth0", true, &["172.16.0.1"]);
        assert_eq!(outside.local_addr(), None);
    }

    #[test]
    fn usable_addr_skips_link_local() {
        let p = port("eth0", "eth0", true, &["169.254.3.3", "fe80::1", "10.0.0.5"]);
        assert_eq!(p.usable_addr(), Some("10.0.0.5".parse().unwrap()));
        assert!(is_unset(None));
        assert!(is_unset(Some("0.0.0.0".parse().unwrap())));
        assert!(!is_unset(Some("10.0.0.5".parse().unwrap())));
    }

    #[test]
    fn labels_expand_to_interfaces() {
        let mut lte = port("lte", "wwan0", false, &[]);
        lte.subnet = None;
        let mut mgmt_off = port("data", "eth2", true, &[]);
        mgmt_off.is_mgmt = false;
        let snapshot = PortSnapshot::new(vec![
            port("eth0", "eth0", true, &[]),
            lte,
            mgmt_off,
        ]);

        assert_eq!(snapshot.if_names_for_label("uplink"), vec!["eth0", "wwan0"]);
        assert_eq!(snapshot.if_names_for_label("freeuplink"), vec!["eth0"]);
        assert_eq!(snapshot.if_names_for_label("lte"), vec!["wwan0"]);
        assert_eq!(snapshot.if_names_for_label("eth2"), vec!["eth2"]);
        assert!(snapshot.if_names_for_label("eth9").is_empty());
        assert!(is_shared_label("Uplink"));
        assert!(!is_shared_label("eth0"));
    }

    #[test]
    fn egress_lookup() {
        let snapshot = PortSnapshot::new(vec![port("eth0", "eth0", true, &["fe80::2", "10.0.0.5"])]);
        let egress = snapshot.egress("eth0").unwrap();
        assert_eq!(egress.local_addr, Some("10.0.0.5".parse().unwrap()));
        assert!(snapshot.egress("wlan0").is_none());
        assert!(snapshot.egress("").is_none());
    }
}
