//! A single-area link-state routing protocol in the manner of OSPF.
//!
//! Adjacencies form with routers on the far end of every routing-grade link
//! and are kept alive by a background hello timer. An adjacency that misses
//! hellos for the dead interval is dropped by the shared neighbor sweep; one
//! whose interface goes down is dropped at once.
//!
//! Each tick floods the link-state database, modelled as a walk over the
//! routers reachable through routing-grade links. Shortest-path first runs
//! whenever the state is dirty or the database changed, and installs a route
//! for every network the device is not itself attached to.

use super::routing_link;
use crate::{
    config::{ConfigError, Configuration, OspfConfig, ProtocolConfig},
    device::{Interface, Ipv4Prefix, Route, SharedDevice},
    id::DeviceId,
    neighbor::NeighborId,
    protocol::{HookContext, HookError, ProtocolBehavior},
    protocol_type::ProtocolType,
    time::SimTime,
    timer::TimerSpec,
};
use std::{
    any::Any,
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap, VecDeque},
    net::Ipv4Addr,
    time::Duration,
};

const HELLO_TIMER: &str = "hello";

/// A router on the other end of one of our links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adjacency {
    pub router: DeviceId,
    pub hostname: String,
    /// The local interface.
    pub interface: String,
    pub remote_interface: String,
    /// The neighbor's address on the shared link, used as next hop.
    pub address: Option<Ipv4Addr>,
    pub cost: u32,
    pub last_hello: SimTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LsaLink {
    neighbor: DeviceId,
    interface: String,
    cost: u32,
}

/// What one router advertises: its links to other routers and the networks
/// it is attached to, with the cost of reaching each.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RouterLsa {
    links: Vec<LsaLink>,
    networks: Vec<(Ipv4Prefix, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FirstHop {
    interface: String,
    next_hop: Option<Ipv4Addr>,
}

/// A copy of the protocol's view, for `show ip ospf` style output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OspfSnapshot {
    pub router_id: Option<Ipv4Addr>,
    pub adjacencies: Vec<Adjacency>,
    pub routers_known: usize,
    pub routes: Vec<Route>,
    pub spf_runs: u64,
}

#[derive(Debug, Default)]
pub struct Ospf {
    router_id: Option<Ipv4Addr>,
    adjacencies: BTreeMap<NeighborId, Adjacency>,
    lsdb: BTreeMap<DeviceId, RouterLsa>,
    lsdb_changed: bool,
    routes: Vec<Route>,
    spf_runs: u64,
}

impl Ospf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router_id(&self) -> Option<Ipv4Addr> {
        self.router_id
    }

    pub fn adjacencies(&self) -> impl Iterator<Item = &Adjacency> {
        self.adjacencies.values()
    }

    /// The configured router ID, or else the highest interface address.
    fn select_router_id(config: &OspfConfig, device: &SharedDevice) -> Option<Ipv4Addr> {
        config.router_id.or_else(|| {
            device
                .interfaces()
                .into_iter()
                .filter_map(|interface| interface.address.map(|prefix| prefix.address))
                .max()
        })
    }

    fn withdraw(&mut self, ctx: &mut HookContext<'_>) {
        let adjacencies = std::mem::take(&mut self.adjacencies);
        for (id, adjacency) in adjacencies {
            ctx.neighbor_lost(&id, &adjacency.interface);
        }
        ctx.device().clear_routes_by_protocol(ProtocolType::Ospf);
        self.routes.clear();
        self.lsdb.clear();
    }
}

fn speaks_ospf(device: &SharedDevice) -> bool {
    device
        .protocol_configuration(ProtocolType::Ospf)
        .map_or(true, |config| config.is_enabled())
}

fn interface_cost(interface: &Interface, config: &OspfConfig) -> u32 {
    interface.cost.unwrap_or(config.default_cost)
}

/// Walks every router reachable from `origin` over routing-grade links.
fn flood(origin: &SharedDevice, config: &OspfConfig) -> BTreeMap<DeviceId, RouterLsa> {
    let mut lsdb = BTreeMap::new();
    let mut queue = VecDeque::from([origin.clone()]);
    while let Some(router) = queue.pop_front() {
        if lsdb.contains_key(&router.id()) {
            continue;
        }
        let mut lsa = RouterLsa {
            links: Vec::new(),
            networks: Vec::new(),
        };
        for interface in router.interfaces() {
            if !interface.is_up {
                continue;
            }
            let cost = interface_cost(&interface, config);
            if let Some(prefix) = interface.address {
                lsa.networks.push((prefix.network(), cost));
            }
            if !routing_link(&router, &interface.name) {
                continue;
            }
            if let Some((remote, _)) = router.connected_device(&interface.name) {
                if speaks_ospf(&remote) {
                    lsa.links.push(LsaLink {
                        neighbor: remote.id(),
                        interface: interface.name.clone(),
                        cost,
                    });
                    queue.push_back(remote);
                }
            }
        }
        lsdb.insert(router.id(), lsa);
    }
    lsdb
}

impl ProtocolBehavior for Ospf {
    type Config = OspfConfig;

    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Ospf
    }

    fn default_config(&self) -> OspfConfig {
        OspfConfig::default()
    }

    fn config_from(&self, config: ProtocolConfig) -> Result<OspfConfig, ConfigError> {
        match config {
            ProtocolConfig::Ospf(config) => Ok(config),
            other => Err(other.mismatch(ProtocolType::Ospf)),
        }
    }

    fn config_into(&self, config: &OspfConfig) -> ProtocolConfig {
        ProtocolConfig::Ospf(config.clone())
    }

    fn on_initialize(&mut self, config: &OspfConfig, ctx: &mut HookContext<'_>) {
        self.router_id = Self::select_router_id(config, ctx.device());
        // Routes the device already learned from a previous run.
        self.routes = ctx
            .device()
            .routing_table()
            .by_protocol(ProtocolType::Ospf)
            .cloned()
            .collect();
        self.lsdb_changed = true;
        tracing::debug!(
            device = %ctx.device().hostname(),
            router_id = ?self.router_id,
            routes = self.routes.len(),
            "OSPF process started"
        );
    }

    fn hold_time(&self, config: &OspfConfig) -> Option<Duration> {
        Some(config.dead_interval())
    }

    fn update_neighbors(
        &mut self,
        config: &OspfConfig,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        let device = ctx.device().clone();
        let now = ctx.now();
        for interface in device.interfaces() {
            if !interface.is_up || !routing_link(&device, &interface.name) {
                continue;
            }
            let Some((remote, remote_interface)) = device.connected_device(&interface.name) else {
                continue;
            };
            if !speaks_ospf(&remote) {
                continue;
            }
            let id = NeighborId::new(format!("{}:{}", remote.hostname(), remote_interface));
            // Known adjacencies are kept alive by hellos.
            if self.adjacencies.contains_key(&id) {
                continue;
            }
            let address = remote
                .interface(&remote_interface)
                .and_then(|remote| remote.address)
                .map(|prefix| prefix.address);
            self.adjacencies.insert(
                id.clone(),
                Adjacency {
                    router: remote.id(),
                    hostname: remote.hostname(),
                    interface: interface.name.clone(),
                    remote_interface,
                    address,
                    cost: interface_cost(&interface, config),
                    last_hello: now,
                },
            );
            ctx.packet_sent(&interface.name, "hello");
            ctx.packet_received(&interface.name, "hello");
            ctx.neighbor_heard(&id, &interface.name);
        }

        let down: Vec<(NeighborId, String)> = self
            .adjacencies
            .iter()
            .filter(|(_, adjacency)| {
                device
                    .interface(&adjacency.interface)
                    .map_or(true, |interface| !interface.is_up)
            })
            .map(|(id, adjacency)| (id.clone(), adjacency.interface.clone()))
            .collect();
        for (id, interface) in down {
            self.adjacencies.remove(&id);
            ctx.neighbor_lost(&id, &interface);
        }

        let lsdb = flood(&device, config);
        if lsdb != self.lsdb {
            self.lsdb = lsdb;
            self.lsdb_changed = true;
        }
        Ok(())
    }

    fn topology_changed(&self) -> bool {
        self.lsdb_changed
    }

    fn run_protocol_calculation(
        &mut self,
        _config: &OspfConfig,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        let device = ctx.device().clone();
        let origin = device.id();

        let mut best: BTreeMap<DeviceId, (u32, Option<FirstHop>)> = BTreeMap::new();
        let mut queue = BinaryHeap::new();
        best.insert(origin, (0, None));
        queue.push(Reverse((0u32, origin)));
        while let Some(Reverse((distance, router))) = queue.pop() {
            let Some((known, hop)) = best.get(&router).cloned() else {
                continue;
            };
            if known < distance {
                continue;
            }
            let Some(lsa) = self.lsdb.get(&router) else {
                continue;
            };
            for link in lsa.links.iter() {
                let hop = if router == origin {
                    // Traffic only leaves through a formed adjacency.
                    let adjacency = self.adjacencies.values().find(|adjacency| {
                        adjacency.interface == link.interface && adjacency.router == link.neighbor
                    });
                    match adjacency {
                        Some(adjacency) => Some(FirstHop {
                            interface: adjacency.interface.clone(),
                            next_hop: adjacency.address,
                        }),
                        None => continue,
                    }
                } else {
                    hop.clone()
                };
                let candidate = distance.saturating_add(link.cost);
                let improves = best
                    .get(&link.neighbor)
                    .map_or(true, |(current, _)| candidate < *current);
                if improves {
                    best.insert(link.neighbor, (candidate, hop));
                    queue.push(Reverse((candidate, link.neighbor)));
                }
            }
        }

        let attached: Vec<Ipv4Prefix> = self
            .lsdb
            .get(&origin)
            .map(|lsa| lsa.networks.iter().map(|(network, _)| *network).collect())
            .unwrap_or_default();
        let mut routes: BTreeMap<Ipv4Prefix, Route> = BTreeMap::new();
        for (router, (distance, hop)) in best.iter() {
            let (Some(hop), Some(lsa)) = (hop, self.lsdb.get(router)) else {
                continue;
            };
            for (network, cost) in lsa.networks.iter() {
                if attached.contains(network) {
                    continue;
                }
                let metric = distance.saturating_add(*cost);
                if routes.get(network).map_or(false, |route| route.metric <= metric) {
                    continue;
                }
                routes.insert(
                    *network,
                    Route {
                        prefix: *network,
                        next_hop: hop.next_hop,
                        interface: hop.interface.clone(),
                        protocol: ProtocolType::Ospf,
                        metric,
                        admin_distance: ProtocolType::Ospf.admin_distance().unwrap_or(110),
                    },
                );
            }
        }

        device.clear_routes_by_protocol(ProtocolType::Ospf);
        self.routes = routes.into_values().collect();
        for route in self.routes.iter() {
            device.add_route(route.clone());
        }
        self.spf_runs += 1;
        self.lsdb_changed = false;
        tracing::debug!(
            device = %device.hostname(),
            routers = self.lsdb.len(),
            routes = self.routes.len(),
            "SPF calculation complete"
        );
        Ok(())
    }

    fn on_neighbor_removed(&mut self, neighbor: &NeighborId, _ctx: &mut HookContext<'_>) -> Option<String> {
        let adjacency = self.adjacencies.remove(neighbor)?;
        self.lsdb_changed = true;
        Some(adjacency.interface)
    }

    fn timers(&self, config: &OspfConfig) -> Vec<TimerSpec> {
        vec![TimerSpec::new(HELLO_TIMER, config.hello_interval())]
    }

    fn on_timer(
        &mut self,
        timer: &'static str,
        _config: &OspfConfig,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        if timer != HELLO_TIMER {
            return Ok(());
        }
        let device = ctx.device().clone();
        let now = ctx.now();
        for (id, adjacency) in self.adjacencies.iter_mut() {
            ctx.packet_sent(&adjacency.interface, "hello");
            let answered = device
                .interface(&adjacency.interface)
                .map_or(false, |interface| interface.is_up)
                && routing_link(&device, &adjacency.interface)
                && device
                    .connected_device(&adjacency.interface)
                    .map_or(false, |(remote, _)| {
                        remote.id() == adjacency.router && speaks_ospf(&remote)
                    });
            if answered {
                ctx.packet_received(&adjacency.interface, "hello");
                ctx.neighbor_heard(id, &adjacency.interface);
                adjacency.last_hello = now;
            }
        }
        Ok(())
    }

    fn on_configuration_applied(&mut self, old: &OspfConfig, new: &OspfConfig, ctx: &mut HookContext<'_>) {
        self.router_id = Self::select_router_id(new, ctx.device());
        if !new.is_enabled() {
            self.withdraw(ctx);
            return;
        }
        if old.default_cost != new.default_cost {
            for adjacency in self.adjacencies.values_mut() {
                if let Some(interface) = ctx.device().interface(&adjacency.interface) {
                    adjacency.cost = interface_cost(&interface, new);
                }
            }
            self.lsdb_changed = true;
        }
    }

    fn on_stop(&mut self, _config: &OspfConfig, ctx: &mut HookContext<'_>) {
        self.withdraw(ctx);
        ctx.state.clear_neighbors();
    }

    fn snapshot(&self, _now: SimTime) -> Box<dyn Any + Send> {
        Box::new(OspfSnapshot {
            router_id: self.router_id,
            adjacencies: self.adjacencies.values().cloned().collect(),
            routers_known: self.lsdb.len(),
            routes: self.routes.clone(),
            spf_runs: self.spf_runs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{ConnectionMetrics, DeviceContext},
        event::{NeighborChange, NeighborChanged},
        id::SubscriberId,
        protocol::{Protocol, ProtocolInstance},
        state::Lifecycle,
        time::{ManualClock, TokioClock},
        topology::{Device, Topology},
        EventBus,
    };
    use std::sync::{Arc, Mutex};

    fn prefix(address: &str) -> Option<Ipv4Prefix> {
        Some(Ipv4Prefix::new(address.parse().unwrap(), 24))
    }

    /// R1 Gi0/0 -- Gi0/0 R2 Gi0/1 -- Gi0/0 R3, with a LAN behind R3.
    fn line(topology: &Topology) -> anyhow::Result<(Arc<Device>, Arc<Device>, Arc<Device>)> {
        let r1 = topology.add_device("R1");
        let r2 = topology.add_device("R2");
        let r3 = topology.add_device("R3");
        r1.add_interface("Gi0/0", prefix("10.0.12.1"))?;
        r2.add_interface("Gi0/0", prefix("10.0.12.2"))?;
        r2.add_interface("Gi0/1", prefix("10.0.23.2"))?;
        r3.add_interface("Gi0/0", prefix("10.0.23.3"))?;
        r3.add_interface("Gi0/1", prefix("192.168.3.1"))?;
        topology.connect(&r1, "Gi0/0", &r2, "Gi0/0", ConnectionMetrics::PERFECT)?;
        topology.connect(&r2, "Gi0/1", &r3, "Gi0/0", ConnectionMetrics::PERFECT)?;
        Ok((r1, r2, r3))
    }

    #[tokio::test]
    async fn spf_installs_routes_through_the_adjacency() -> anyhow::Result<()> {
        let clock = ManualClock::shared();
        let bus = EventBus::shared();
        let topology = Topology::new(bus.clone(), clock.clone());
        let (r1, _, _) = line(&topology)?;

        let ospf = ProtocolInstance::new(Ospf::new(), bus, clock.clone()).shared();
        ospf.initialize(r1.clone()).await?;
        ospf.update_state().await?;

        let snapshot = ospf.typed_state::<OspfSnapshot>().unwrap();
        assert_eq!(snapshot.router_id, Some("10.0.12.1".parse::<Ipv4Addr>()?));
        assert_eq!(snapshot.adjacencies.len(), 1);
        assert_eq!(snapshot.routers_known, 3);
        assert_eq!(snapshot.spf_runs, 1);

        let table = r1.routing_table();
        let lan = table.lookup("192.168.3.10".parse()?).unwrap();
        assert_eq!(lan.next_hop, Some("10.0.12.2".parse::<Ipv4Addr>()?));
        assert_eq!(lan.interface, "Gi0/0");
        assert_eq!(lan.metric, 30);
        assert_eq!(table.lookup("10.0.23.3".parse()?).unwrap().metric, 20);
        assert!(table.lookup("10.0.12.9".parse()?).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn quiet_neighbor_is_dropped_after_the_dead_interval() -> anyhow::Result<()> {
        let clock = ManualClock::shared();
        let bus = EventBus::shared();
        let topology = Topology::new(bus.clone(), clock.clone());
        let (r1, _, _) = line(&topology)?;

        let lost = Arc::new(Mutex::new(Vec::new()));
        let record = lost.clone();
        bus.subscribe(SubscriberId::from_string("test"), move |event: Arc<NeighborChanged>| {
            let record = record.clone();
            async move {
                if event.change == NeighborChange::Lost {
                    record.lock().unwrap().push(event.neighbor.clone());
                }
                Ok(())
            }
        });

        let ospf = ProtocolInstance::new(Ospf::new(), bus, clock.clone()).shared();
        ospf.initialize(r1.clone()).await?;
        ospf.update_state().await?;
        topology.disconnect(&r1, "Gi0/0");

        clock.advance(Duration::from_secs(40));
        ospf.update_state().await?;
        assert_eq!(ospf.state()?.neighbors.len(), 1);

        clock.advance(Duration::from_secs(1));
        ospf.update_state().await?;
        assert!(ospf.state()?.neighbors.is_empty());
        assert_eq!(*lost.lock().unwrap(), vec![NeighborId::from("R2:Gi0/0")]);
        assert_eq!(r1.routing_table().by_protocol(ProtocolType::Ospf).count(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn hellos_keep_the_adjacency_until_stopped() -> anyhow::Result<()> {
        let clock = Arc::new(TokioClock::new());
        let bus = EventBus::shared();
        let topology = Topology::new(bus.clone(), clock.clone());
        let (r1, _, _) = line(&topology)?;

        let instance = ProtocolInstance::new(Ospf::new(), bus, clock.clone());
        assert!(instance.active_timers().is_empty());
        let ospf = instance.shared();
        ospf.initialize(r1.clone()).await?;
        ospf.update_state().await?;

        tokio::time::sleep(Duration::from_secs(95)).await;
        ospf.update_state().await?;
        assert_eq!(ospf.state()?.neighbors.len(), 1);
        let sent = ospf.metrics().unwrap().packets_sent;
        // One hello when the adjacency formed, then one per interval.
        assert_eq!(sent, 10);

        ospf.stop().await?;
        assert_eq!(ospf.lifecycle(), Lifecycle::Stopped);
        assert_eq!(r1.routing_table().by_protocol(ProtocolType::Ospf).count(), 0);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ospf.metrics().unwrap().packets_sent, sent);
        Ok(())
    }

    #[tokio::test]
    async fn disabling_withdraws_routes() -> anyhow::Result<()> {
        let clock = ManualClock::shared();
        let bus = EventBus::shared();
        let topology = Topology::new(bus.clone(), clock.clone());
        let (r1, _, _) = line(&topology)?;

        let ospf = ProtocolInstance::new(Ospf::new(), bus, clock.clone()).shared();
        ospf.initialize(r1.clone()).await?;
        ospf.update_state().await?;
        assert_eq!(ospf.lifecycle(), Lifecycle::Active);
        assert!(r1.routing_table().by_protocol(ProtocolType::Ospf).count() > 0);

        ospf.apply_configuration(ProtocolConfig::Ospf(OspfConfig {
            enabled: false,
            ..Default::default()
        }))
        .await?;
        assert_eq!(ospf.lifecycle(), Lifecycle::Inactive);
        assert_eq!(r1.routing_table().by_protocol(ProtocolType::Ospf).count(), 0);
        assert!(!ospf.state()?.active);
        Ok(())
    }
}
