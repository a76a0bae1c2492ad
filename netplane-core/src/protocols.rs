//! Concrete protocols built on [`ProtocolBehavior`](crate::protocol::ProtocolBehavior).

pub mod arp;
pub use arp::Arp;

pub mod discovery;
pub use discovery::Discovery;

pub mod ospf;
pub use ospf::Ospf;

use crate::{
    device::SharedDevice, event_bus::EventBus, protocol::SharedProtocol,
    protocol::ProtocolInstance, protocol_type::ProtocolType, time::SharedClock,
};
use std::sync::Arc;

/// Creates an instance of `protocol` with its default configuration, if
/// there is an implementation for it.
pub fn create(protocol: ProtocolType, bus: Arc<EventBus>, clock: SharedClock) -> Option<SharedProtocol> {
    let instance = match protocol {
        ProtocolType::Arp => ProtocolInstance::new(Arp::new(), bus, clock).shared(),
        ProtocolType::Cdp => ProtocolInstance::new(Discovery::cdp(), bus, clock).shared(),
        ProtocolType::Lldp => ProtocolInstance::new(Discovery::lldp(), bus, clock).shared(),
        ProtocolType::Ospf => ProtocolInstance::new(Ospf::new(), bus, clock).shared(),
        _ => return None,
    };
    Some(instance)
}

/// Whether the link behind `interface` on `device` can carry neighbor
/// traffic at all: it must be fit for routing or for realtime use.
pub(crate) fn usable_link(device: &SharedDevice, interface: &str) -> bool {
    device.connection_metrics(interface).map_or(false, |metrics| {
        metrics.suitable_for_realtime || metrics.suitable_for_routing
    })
}

/// Whether the link behind `interface` on `device` is usable by a routing protocol.
pub(crate) fn routing_link(device: &SharedDevice, interface: &str) -> bool {
    device
        .connection_metrics(interface)
        .map_or(false, |metrics| metrics.suitable_for_routing)
}
