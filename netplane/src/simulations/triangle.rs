use crate::Simulation;
use netplane_core::{device::ConnectionMetrics, DependencyManager, ExitStatus, ProtocolType};

/// Every router runs these.
pub(super) const PROTOCOLS: [ProtocolType; 3] =
    [ProtocolType::Arp, ProtocolType::Cdp, ProtocolType::Ospf];

/// Three routers cabled in a ring. R2 and R3 each have a LAN that nothing is
/// plugged into.
///
/// ```text
///            R1
///   Gi0/0  /    \  Gi0/1
///   Gi0/0 /      \ Gi0/0
///       R2 ------ R3
///        Gi0/1  Gi0/1
/// ```
pub fn triangle_topology(dependencies: DependencyManager) -> anyhow::Result<Simulation> {
    let sim = Simulation::new(dependencies);
    let r1 = sim.router("R1", &[("Gi0/0", "10.0.12.1/24"), ("Gi0/1", "10.0.13.1/24")])?;
    let r2 = sim.router(
        "R2",
        &[
            ("Gi0/0", "10.0.12.2/24"),
            ("Gi0/1", "10.0.23.2/24"),
            ("Gi0/2", "192.168.2.1/24"),
        ],
    )?;
    let r3 = sim.router(
        "R3",
        &[
            ("Gi0/0", "10.0.13.3/24"),
            ("Gi0/1", "10.0.23.3/24"),
            ("Gi0/2", "192.168.3.1/24"),
        ],
    )?;

    let topology = sim.topology();
    topology.connect(&r1, "Gi0/0", &r2, "Gi0/0", ConnectionMetrics::PERFECT)?;
    topology.connect(&r1, "Gi0/1", &r3, "Gi0/0", ConnectionMetrics::PERFECT)?;
    topology.connect(&r2, "Gi0/1", &r3, "Gi0/1", ConnectionMetrics::PERFECT)?;

    for router in [&r1, &r2, &r3] {
        sim.install(router, &PROTOCOLS)?;
    }
    Ok(sim)
}

/// Brings up every protocol and lets the ring converge for `ticks` ticks.
pub async fn triangle(sim: &Simulation, ticks: u64) -> anyhow::Result<ExitStatus> {
    sim.start().await?;
    Ok(sim.run(ticks).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netplane_core::{
        protocols::{arp::ArpTable, discovery::DiscoveryTable},
        DeviceContext, Lifecycle, Protocol,
    };
    use std::net::Ipv4Addr;

    #[tokio::test(start_paused = true)]
    async fn triangle() -> anyhow::Result<()> {
        let sim = triangle_topology(DependencyManager::with_defaults())?;
        assert_eq!(super::triangle(&sim, 5).await?, ExitStatus::TickLimit);
        assert_eq!(sim.scheduler().tick_count(), 5);

        let r1 = sim.device("R1").unwrap();
        let route = r1
            .routing_table()
            .lookup(Ipv4Addr::new(192, 168, 3, 7))
            .cloned()
            .unwrap();
        assert_eq!(route.interface, "Gi0/1");
        assert_eq!(route.next_hop, Some(Ipv4Addr::new(10, 0, 13, 3)));
        assert_eq!(route.metric, 20);
        assert_eq!(route.protocol, ProtocolType::Ospf);

        let scheduler = sim.scheduler();
        let cdp = scheduler.protocol(r1.id(), ProtocolType::Cdp).unwrap();
        let table = cdp.typed_state::<DiscoveryTable>().unwrap();
        assert_eq!(table.entries.len(), 2);

        let arp = scheduler.protocol(r1.id(), ProtocolType::Arp).unwrap();
        let cache = arp.typed_state::<ArpTable>().unwrap();
        assert!(cache.lookup(Ipv4Addr::new(10, 0, 12, 2)).is_some());

        for instance in scheduler.protocols(r1.id()) {
            assert_eq!(instance.lifecycle(), Lifecycle::Active);
        }
        sim.finish().await;
        Ok(())
    }
}
