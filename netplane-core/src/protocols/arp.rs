//! Address resolution protocol (ARP) associates IPv4 addresses with MAC
//! addresses.
//!
//! Local interface addresses are entered as permanent entries when the
//! protocol initializes. Remote entries are learned from devices on the other
//! end of each link, refreshed every tick while the link stays usable, and
//! aged out after the configured entry timeout.

use super::usable_link;
use crate::{
    config::{ArpConfig, ConfigError, ProtocolConfig},
    device::MacAddress,
    neighbor::NeighborId,
    protocol::{HookContext, HookError, ProtocolBehavior},
    protocol_type::ProtocolType,
    time::SimTime,
};
use std::{any::Any, collections::BTreeMap, net::Ipv4Addr, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// One of the device's own addresses. Never expires.
    Local,
    /// Learned from a neighbor.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    pub mac: MacAddress,
    pub interface: String,
    pub kind: EntryKind,
    pub learned_at: SimTime,
}

/// A copy of the ARP cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpTable {
    pub entries: BTreeMap<Ipv4Addr, ArpEntry>,
}

impl ArpTable {
    pub fn lookup(&self, address: Ipv4Addr) -> Option<MacAddress> {
        self.entries.get(&address).map(|entry| entry.mac)
    }
}

#[derive(Debug, Default)]
pub struct Arp {
    table: BTreeMap<Ipv4Addr, ArpEntry>,
}

impl Arp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, address: Ipv4Addr) -> Option<MacAddress> {
        self.table.get(&address).map(|entry| entry.mac)
    }

    fn learn_local(&mut self, ctx: &HookContext<'_>) {
        for interface in ctx.device().interfaces() {
            if let Some(prefix) = interface.address {
                self.table.insert(
                    prefix.address,
                    ArpEntry {
                        mac: interface.mac,
                        interface: interface.name.clone(),
                        kind: EntryKind::Local,
                        learned_at: ctx.now(),
                    },
                );
            }
        }
    }
}

impl ProtocolBehavior for Arp {
    type Config = ArpConfig;

    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Arp
    }

    fn default_config(&self) -> ArpConfig {
        ArpConfig::default()
    }

    fn config_from(&self, config: ProtocolConfig) -> Result<ArpConfig, ConfigError> {
        match config {
            ProtocolConfig::Arp(config) => Ok(config),
            other => Err(other.mismatch(ProtocolType::Arp)),
        }
    }

    fn config_into(&self, config: &ArpConfig) -> ProtocolConfig {
        ProtocolConfig::Arp(config.clone())
    }

    fn on_initialize(&mut self, _config: &ArpConfig, ctx: &mut HookContext<'_>) {
        self.learn_local(ctx);
    }

    fn hold_time(&self, config: &ArpConfig) -> Option<Duration> {
        Some(config.entry_timeout())
    }

    fn update_neighbors(
        &mut self,
        _config: &ArpConfig,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        let device = ctx.device().clone();
        for interface in device.interfaces() {
            if !interface.is_up || interface.address.is_none() {
                continue;
            }
            if !usable_link(&device, &interface.name) {
                continue;
            }
            let Some((remote, remote_interface)) = device.connected_device(&interface.name) else {
                continue;
            };
            let Some(remote_interface) = remote.interface(&remote_interface) else {
                continue;
            };
            let Some(remote_prefix) = remote_interface.address else {
                continue;
            };

            let address = remote_prefix.address;
            let id = NeighborId::new(address.to_string());
            let known = self.table.get(&address).map(|entry| {
                (
                    entry.kind,
                    entry.mac == remote_interface.mac && entry.interface == interface.name,
                )
            });
            match known {
                Some((EntryKind::Local, _)) => continue,
                Some((EntryKind::Dynamic, true)) => {}
                _ => {
                    self.table.insert(
                        address,
                        ArpEntry {
                            mac: remote_interface.mac,
                            interface: interface.name.clone(),
                            kind: EntryKind::Dynamic,
                            learned_at: ctx.now(),
                        },
                    );
                    ctx.packet_received(&interface.name, "reply");
                    if known.is_some() {
                        ctx.neighbor_updated(&id, &interface.name);
                    }
                }
            }
            ctx.neighbor_heard(&id, &interface.name);
        }
        Ok(())
    }

    fn run_protocol_calculation(
        &mut self,
        _config: &ArpConfig,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        // Local entries follow the interface addresses.
        self.table.retain(|_, entry| entry.kind == EntryKind::Dynamic);
        self.learn_local(ctx);
        tracing::debug!(
            device = %ctx.device().hostname(),
            entries = self.table.len(),
            "ARP cache rebuilt"
        );
        Ok(())
    }

    fn on_neighbor_removed(&mut self, neighbor: &NeighborId, _ctx: &mut HookContext<'_>) -> Option<String> {
        let address: Ipv4Addr = neighbor.as_str().parse().ok()?;
        match self.table.get(&address) {
            Some(entry) if entry.kind == EntryKind::Dynamic => {
                self.table.remove(&address).map(|entry| entry.interface)
            }
            _ => None,
        }
    }

    fn on_stop(&mut self, _config: &ArpConfig, ctx: &mut HookContext<'_>) {
        self.table.retain(|_, entry| entry.kind == EntryKind::Local);
        ctx.state.clear_neighbors();
    }

    fn snapshot(&self, _now: SimTime) -> Box<dyn Any + Send> {
        Box::new(ArpTable {
            entries: self.table.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{ConnectionMetrics, DeviceContext, Ipv4Prefix},
        protocol::{Protocol, ProtocolInstance},
        time::ManualClock,
        topology::Topology,
        EventBus,
    };

    fn prefix(address: &str) -> Option<Ipv4Prefix> {
        Some(Ipv4Prefix::new(address.parse().unwrap(), 24))
    }

    #[tokio::test]
    async fn learns_remote_addresses_over_usable_links() -> anyhow::Result<()> {
        let clock = ManualClock::shared();
        let bus = EventBus::shared();
        let topology = Topology::new(bus.clone(), clock.clone());
        let r1 = topology.add_device("R1");
        let r2 = topology.add_device("R2");
        let r3 = topology.add_device("R3");
        r1.add_interface("Gi0/0", prefix("10.0.12.1"))?;
        r1.add_interface("Gi0/1", prefix("10.0.13.1"))?;
        r2.add_interface("Gi0/0", prefix("10.0.12.2"))?;
        r3.add_interface("Gi0/0", prefix("10.0.13.3"))?;
        topology.connect(&r1, "Gi0/0", &r2, "Gi0/0", ConnectionMetrics::PERFECT)?;
        topology.connect(&r1, "Gi0/1", &r3, "Gi0/0", ConnectionMetrics::DEGRADED)?;

        let arp = ProtocolInstance::new(Arp::new(), bus, clock.clone()).shared();
        arp.initialize(r1.clone()).await?;
        arp.update_state().await?;

        let table = arp.typed_state::<ArpTable>().unwrap();
        assert_eq!(table.entries[&"10.0.12.1".parse::<Ipv4Addr>()?].kind, EntryKind::Local);
        let r2_mac = r2.interface("Gi0/0").unwrap().mac;
        assert_eq!(table.lookup("10.0.12.2".parse()?), Some(r2_mac));
        assert_eq!(table.lookup("10.0.13.3".parse()?), None);
        assert_eq!(arp.metrics().unwrap().packets_received, 1);
        Ok(())
    }

    #[tokio::test]
    async fn stale_entries_age_out() -> anyhow::Result<()> {
        let clock = ManualClock::shared();
        let bus = EventBus::shared();
        let topology = Topology::new(bus.clone(), clock.clone());
        let r1 = topology.add_device("R1");
        let r2 = topology.add_device("R2");
        r1.add_interface("Gi0/0", prefix("10.0.12.1"))?;
        r2.add_interface("Gi0/0", prefix("10.0.12.2"))?;
        topology.connect(&r1, "Gi0/0", &r2, "Gi0/0", ConnectionMetrics::PERFECT)?;

        let arp = ProtocolInstance::new(Arp::new(), bus, clock.clone()).shared();
        arp.apply_configuration(ProtocolConfig::Arp(ArpConfig {
            enabled: true,
            entry_timeout_secs: 60,
        }))
        .await?;
        arp.initialize(r1.clone()).await?;
        arp.update_state().await?;
        topology.disconnect(&r1, "Gi0/0");

        clock.advance(Duration::from_secs(61));
        let expired = arp.sweep_neighbors().await?;
        assert_eq!(expired, vec![NeighborId::from("10.0.12.2")]);
        let table = arp.typed_state::<ArpTable>().unwrap();
        assert_eq!(table.lookup("10.0.12.2".parse()?), None);
        assert!(table.lookup("10.0.12.1".parse()?).is_some());
        Ok(())
    }

    #[test]
    fn rejects_foreign_configuration() {
        let arp = Arp::new();
        let foreign = ProtocolConfig::Cdp(crate::config::DiscoveryConfig::cdp());
        assert_eq!(
            arp.config_from(foreign),
            Err(ConfigError::WrongProtocol {
                expected: ProtocolType::Arp,
                found: ProtocolType::Cdp,
            })
        );
    }
}
