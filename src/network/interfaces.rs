//! Network interface monitoring
//!
//! Embedded network stacks can silently drop multicast membership when an
//! interface goes down and comes back (DHCP renewal, cable replug). The
//! monitor diffs the IPv4 addresses of physical interfaces and reports any
//! change so the caller can rejoin its multicast group.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::util::Worker;

/// Interface name prefixes treated as physical (wired and wireless)
const PHYSICAL_PREFIXES: [&str; 4] = ["eth", "wlan", "en", "wl"];

/// True for eth0, wlan0, enp3s0, wlp2s0 and friends
pub fn is_physical_interface(name: &str) -> bool {
    PHYSICAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// IPv4 addresses of physical interfaces that are up
pub fn physical_ipv4_addrs() -> BTreeSet<Ipv4Addr> {
    match get_if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter(|iface| is_physical_interface(&iface.name))
            .filter_map(|iface| match iface.ip() {
                IpAddr::V4(ip) if !ip.is_loopback() => Some(ip),
                _ => None,
            })
            .collect(),
        Err(e) => {
            tracing::debug!("Failed to list interfaces: {}", e);
            BTreeSet::new()
        }
    }
}

/// Every non-loopback IPv4 address, used for per-interface multicast joins
pub fn multicast_capable_addrs() -> Vec<Ipv4Addr> {
    match get_if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter_map(|iface| match iface.ip() {
                IpAddr::V4(ip) if !ip.is_loopback() => Some(ip),
                _ => None,
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Difference between two address snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressChange {
    pub added: BTreeSet<Ipv4Addr>,
    pub removed: BTreeSet<Ipv4Addr>,
}

impl AddressChange {
    pub fn between(old: &BTreeSet<Ipv4Addr>, new: &BTreeSet<Ipv4Addr>) -> Self {
        Self {
            added: new.difference(old).copied().collect(),
            removed: old.difference(new).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Background thread that reports interface address changes
pub struct InterfaceMonitor {
    worker: Worker,
}

impl InterfaceMonitor {
    /// Start polling. `snapshot` is injected so tests can fake interfaces.
    pub fn start<S, F>(interval: Duration, snapshot: S, on_change: F) -> std::io::Result<Self>
    where
        S: Fn() -> BTreeSet<Ipv4Addr> + Send + 'static,
        F: Fn(&AddressChange) + Send + 'static,
    {
        let mut known = snapshot();
        let worker = Worker::spawn("sacn-netmon", move |stop| {
            while !stop.wait(interval) {
                let current = snapshot();
                let change = AddressChange::between(&known, &current);
                if change.is_empty() {
                    continue;
                }
                if !change.added.is_empty() {
                    tracing::info!("Network: interfaces added {:?}", change.added);
                }
                if !change.removed.is_empty() {
                    tracing::info!("Network: interfaces removed {:?}", change.removed);
                }
                known = current;
                on_change(&change);
            }
        })?;
        Ok(Self { worker })
    }

    /// Stop the monitor thread (bounded join)
    pub fn stop(self, timeout: Duration) {
        self.worker.stop(timeout);
    }
}
