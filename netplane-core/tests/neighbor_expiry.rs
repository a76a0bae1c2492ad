mod common;

use common::{Lab, Puppet, Script};
use netplane_core::{
    config::{ArpConfig, ProtocolConfig},
    event::{NeighborChange, NeighborChanged},
    protocols::{discovery::DiscoveryTable, Discovery},
    NeighborId, ProtocolInstance, ProtocolType, SubscriberId,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

fn record_neighbor_events(lab: &Lab) -> Arc<Mutex<Vec<NeighborChanged>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    lab.bus.subscribe(
        SubscriberId::from_string("neighbor-log"),
        move |event: Arc<NeighborChanged>| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push((*event).clone());
                Ok(())
            }
        },
    );
    seen
}

#[tokio::test]
async fn cdp_neighbor_expires_after_the_hold_time() -> anyhow::Result<()> {
    let lab = Lab::new();
    let (r1, r2) = lab.pair();
    let events = record_neighbor_events(&lab);
    let cdp = ProtocolInstance::new(Discovery::cdp(), lab.bus.clone(), lab.clock.clone()).shared();
    cdp.initialize(r1.clone()).await?;
    cdp.update_state().await?;
    let neighbor = NeighborId::from("R2:Gi0/0");
    assert!(cdp.state()?.neighbors.contains_key(&neighbor));

    lab.topology.disconnect(&r2, "Gi0/0");
    lab.clock.advance(Duration::from_secs(179));
    assert!(cdp.sweep_neighbors().await?.is_empty());
    assert!(cdp.state()?.neighbors.contains_key(&neighbor));

    lab.clock.advance(Duration::from_secs(2));
    assert_eq!(cdp.sweep_neighbors().await?, vec![neighbor.clone()]);
    assert!(cdp.state()?.neighbors.is_empty());
    assert!(cdp.typed_state::<DiscoveryTable>().unwrap().entries.is_empty());

    let events = events.lock().unwrap();
    let changes: Vec<NeighborChange> = events.iter().map(|event| event.change).collect();
    assert_eq!(changes, vec![NeighborChange::Discovered, NeighborChange::Lost]);
    let lost = &events[1];
    assert_eq!(lost.neighbor, neighbor);
    assert_eq!(lost.protocol, ProtocolType::Cdp);
    assert_eq!(lost.interface.as_deref(), Some("Gi0/0"));
    Ok(())
}

#[tokio::test]
async fn exactly_the_hold_time_is_not_expired() -> anyhow::Result<()> {
    let lab = Lab::new();
    let (r1, _r2) = lab.pair();
    let script = Script::default();
    let puppet = ProtocolInstance::new(
        Puppet::new(ProtocolType::Arp, script.clone()),
        lab.bus.clone(),
        lab.clock.clone(),
    )
    .shared();
    puppet
        .apply_configuration(ProtocolConfig::Arp(ArpConfig {
            enabled: true,
            entry_timeout_secs: 60,
        }))
        .await?;
    puppet.initialize(r1.clone()).await?;
    script.hear(&["quiet", "chatty"]);
    puppet.update_state().await?;
    script.hear(&["chatty"]);

    lab.clock.advance(Duration::from_secs(60));
    puppet.update_state().await?;
    assert_eq!(puppet.state()?.neighbors.len(), 2);

    lab.clock.advance(Duration::from_secs(1));
    puppet.update_state().await?;
    let state = puppet.state()?;
    assert_eq!(
        state.neighbors.keys().cloned().collect::<Vec<_>>(),
        vec![NeighborId::from("chatty")]
    );
    assert_eq!(*script.removed.lock().unwrap(), vec![NeighborId::from("quiet")]);
    Ok(())
}

#[tokio::test]
async fn sweeping_twice_removes_nothing_more() -> anyhow::Result<()> {
    let lab = Lab::new();
    let (r1, _r2) = lab.pair();
    let script = Script::default();
    let puppet = ProtocolInstance::new(
        Puppet::new(ProtocolType::Arp, script.clone()),
        lab.bus.clone(),
        lab.clock.clone(),
    )
    .shared();
    puppet
        .apply_configuration(ProtocolConfig::Arp(ArpConfig {
            enabled: true,
            entry_timeout_secs: 60,
        }))
        .await?;
    puppet.initialize(r1.clone()).await?;
    script.hear(&["a", "b"]);
    puppet.update_state().await?;

    lab.clock.advance(Duration::from_secs(90));
    let expired = puppet.sweep_neighbors().await?;
    assert_eq!(expired, vec![NeighborId::from("a"), NeighborId::from("b")]);
    assert!(puppet.sweep_neighbors().await?.is_empty());
    assert_eq!(script.removed.lock().unwrap().len(), 2);
    // The removals are picked up by the next calculation.
    assert!(puppet.state()?.changed);
    Ok(())
}

#[tokio::test]
async fn sweep_before_initialize_is_refused() {
    let lab = Lab::new();
    let puppet = ProtocolInstance::new(
        Puppet::new(ProtocolType::Arp, Script::default()),
        lab.bus.clone(),
        lab.clock.clone(),
    )
    .shared();
    assert!(puppet.sweep_neighbors().await.is_err());
}
