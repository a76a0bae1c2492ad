//! Link-layer neighbor discovery, as done by CDP and LLDP.
//!
//! Both protocols advertise the device over every usable link at a fixed
//! interval and keep a table of the devices heard on each link. An entry that
//! is not refreshed within the hold time is dropped. The two differ only in
//! their defaults (CDP: 60 s / 180 s, LLDP: 30 s / 120 s).

use super::usable_link;
use crate::{
    config::{ConfigError, Configuration, DiscoveryConfig, ProtocolConfig},
    id::DeviceId,
    neighbor::{NeighborId, NeighborTable, Observation},
    protocol::{HookContext, HookError, ProtocolBehavior},
    protocol_type::ProtocolType,
    time::SimTime,
};
use std::{any::Any, time::Duration};

/// What a discovery advertisement tells us about the device that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredInfo {
    pub device: DeviceId,
    pub hostname: String,
    pub remote_interface: String,
}

/// One row of `show cdp neighbors`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEntry {
    pub neighbor: NeighborId,
    pub hostname: String,
    pub local_interface: String,
    pub remote_interface: String,
    /// Seconds left before the entry expires.
    pub hold_remaining: u64,
}

/// A copy of the neighbor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryTable {
    pub protocol: ProtocolType,
    pub entries: Vec<DiscoveryEntry>,
    pub advertisements_sent: u64,
}

#[derive(Debug)]
pub struct Discovery {
    protocol: ProtocolType,
    neighbors: NeighborTable<DiscoveredInfo>,
    last_advertisement: Option<SimTime>,
    advertisements_sent: u64,
    /// Hostnames per local interface, rebuilt by the calculation.
    summary: Vec<(String, String)>,
}

impl Discovery {
    fn new(protocol: ProtocolType) -> Self {
        Self {
            protocol,
            neighbors: NeighborTable::new(),
            last_advertisement: None,
            advertisements_sent: 0,
            summary: Vec::new(),
        }
    }

    pub fn cdp() -> Self {
        Self::new(ProtocolType::Cdp)
    }

    pub fn lldp() -> Self {
        Self::new(ProtocolType::Lldp)
    }

    pub fn neighbors(&self) -> &NeighborTable<DiscoveredInfo> {
        &self.neighbors
    }

    /// `(local interface, neighbor hostname)` pairs, sorted.
    pub fn summary(&self) -> &[(String, String)] {
        &self.summary
    }

    /// Interfaces advertisements go out on.
    fn advertising_interfaces(&self, config: &DiscoveryConfig, ctx: &HookContext<'_>) -> Vec<String> {
        ctx.device()
            .interfaces()
            .into_iter()
            .filter(|interface| interface.is_up && config.is_enabled_on(&interface.name))
            .map(|interface| interface.name)
            .collect()
    }

    /// Drops every neighbor learned on `interface`.
    fn forget_interface(&mut self, interface: &str, ctx: &mut HookContext<'_>) {
        let learned: Vec<NeighborId> = self
            .neighbors
            .iter()
            .filter(|neighbor| neighbor.interface == interface)
            .map(|neighbor| neighbor.id.clone())
            .collect();
        for id in learned {
            self.neighbors.remove(&id);
            ctx.neighbor_lost(&id, interface);
        }
    }
}

impl ProtocolBehavior for Discovery {
    type Config = DiscoveryConfig;

    fn protocol_type(&self) -> ProtocolType {
        self.protocol
    }

    fn default_config(&self) -> DiscoveryConfig {
        match self.protocol {
            ProtocolType::Lldp => DiscoveryConfig::lldp(),
            _ => DiscoveryConfig::cdp(),
        }
    }

    fn config_from(&self, config: ProtocolConfig) -> Result<DiscoveryConfig, ConfigError> {
        match (self.protocol, config) {
            (ProtocolType::Cdp, ProtocolConfig::Cdp(config))
            | (ProtocolType::Lldp, ProtocolConfig::Lldp(config)) => Ok(config),
            (protocol, other) => Err(other.mismatch(protocol)),
        }
    }

    fn config_into(&self, config: &DiscoveryConfig) -> ProtocolConfig {
        match self.protocol {
            ProtocolType::Lldp => ProtocolConfig::Lldp(config.clone()),
            _ => ProtocolConfig::Cdp(config.clone()),
        }
    }

    fn hold_time(&self, config: &DiscoveryConfig) -> Option<Duration> {
        Some(config.hold_time())
    }

    fn update_neighbors(
        &mut self,
        config: &DiscoveryConfig,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        let device = ctx.device().clone();
        let now = ctx.now();
        for local in self.advertising_interfaces(config, ctx) {
            if !usable_link(&device, &local) {
                continue;
            }
            let Some((remote, remote_interface)) = device.connected_device(&local) else {
                continue;
            };
            // A peer that has the protocol turned off sends nothing.
            let silent = remote
                .protocol_configuration(self.protocol)
                .map_or(false, |config| !config.is_enabled());
            if silent {
                continue;
            }

            let hostname = remote.hostname();
            let id = NeighborId::new(format!("{}:{}", hostname, remote_interface));
            let info = DiscoveredInfo {
                device: remote.id(),
                hostname,
                remote_interface,
            };
            match self
                .neighbors
                .observe(id.clone(), &local, info, config.hold_time(), now)
            {
                Observation::Discovered => ctx.packet_received(&local, "advertisement"),
                Observation::Updated => {
                    ctx.packet_received(&local, "advertisement");
                    ctx.neighbor_updated(&id, &local);
                }
                Observation::Refreshed => {}
            }
            ctx.neighbor_heard(&id, &local);
        }
        Ok(())
    }

    fn process_timers(
        &mut self,
        config: &DiscoveryConfig,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        let now = ctx.now();
        let due = self.last_advertisement.map_or(true, |last| {
            now.saturating_since(last) >= config.advertisement_interval()
        });
        if !due {
            return Ok(());
        }
        for local in self.advertising_interfaces(config, ctx) {
            if usable_link(ctx.device(), &local) {
                ctx.packet_sent(&local, "advertisement");
                self.advertisements_sent += 1;
            }
        }
        self.last_advertisement = Some(now);
        Ok(())
    }

    fn run_protocol_calculation(
        &mut self,
        _config: &DiscoveryConfig,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        let mut summary: Vec<(String, String)> = self
            .neighbors
            .iter()
            .map(|neighbor| (neighbor.interface.clone(), neighbor.info.hostname.clone()))
            .collect();
        summary.sort();
        summary.dedup();
        self.summary = summary;
        tracing::debug!(
            device = %ctx.device().hostname(),
            protocol = %self.protocol,
            neighbors = self.neighbors.len(),
            "Neighbor table rebuilt"
        );
        Ok(())
    }

    fn on_neighbor_removed(
        &mut self,
        neighbor: &NeighborId,
        _ctx: &mut HookContext<'_>,
    ) -> Option<String> {
        self.neighbors.remove(neighbor).map(|neighbor| neighbor.interface)
    }

    fn on_configuration_applied(
        &mut self,
        old: &DiscoveryConfig,
        new: &DiscoveryConfig,
        ctx: &mut HookContext<'_>,
    ) {
        if old.advertisement_interval_secs != new.advertisement_interval_secs {
            // Advertise on the next tick under the new schedule.
            self.last_advertisement = None;
        }
        for interface in new.disabled_interfaces.iter() {
            if old.is_enabled_on(interface) {
                self.forget_interface(interface, ctx);
            }
        }
        if !new.is_enabled() {
            let interfaces: Vec<String> = self
                .neighbors
                .iter()
                .map(|neighbor| neighbor.interface.clone())
                .collect();
            for interface in interfaces {
                self.forget_interface(&interface, ctx);
            }
        }
    }

    fn on_stop(&mut self, _config: &DiscoveryConfig, ctx: &mut HookContext<'_>) {
        self.neighbors.clear();
        self.summary.clear();
        self.last_advertisement = None;
        ctx.state.clear_neighbors();
    }

    fn snapshot(&self, now: SimTime) -> Box<dyn Any + Send> {
        let entries = self
            .neighbors
            .iter()
            .map(|neighbor| DiscoveryEntry {
                neighbor: neighbor.id.clone(),
                hostname: neighbor.info.hostname.clone(),
                local_interface: neighbor.interface.clone(),
                remote_interface: neighbor.info.remote_interface.clone(),
                hold_remaining: neighbor.remaining(now).as_secs(),
            })
            .collect();
        Box::new(DiscoveryTable {
            protocol: self.protocol,
            entries,
            advertisements_sent: self.advertisements_sent,
        })
    }
}
