//! A minimal in-memory physical model: devices, interfaces, and point-to-point
//! cables with link-quality metrics.

use crate::{
    config::ProtocolConfig,
    device::{
        ConnectionMetrics, DeviceContext, Interface, Ipv4Prefix, MacAddress, Route, RoutingTable,
        SharedDevice,
    },
    event::InterfaceStateChanged,
    event_bus::EventBus,
    id::DeviceId,
    protocol_type::ProtocolType,
    time::SharedClock,
    FxDashMap,
};
use rustc_hash::FxHashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, Weak,
};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("{device} has no interface named {interface}")]
    MissingInterface { device: String, interface: String },
    #[error("{device} {interface} is already cabled")]
    AlreadyConnected { device: String, interface: String },
    #[error("{device} already has an interface named {interface}")]
    DuplicateInterface { device: String, interface: String },
}

struct Link {
    remote: Weak<Device>,
    remote_interface: String,
    metrics: ConnectionMetrics,
}

#[derive(Default)]
struct DeviceInner {
    interfaces: Vec<Interface>,
    links: FxHashMap<String, Link>,
    routes: RoutingTable,
    configurations: FxHashMap<ProtocolType, ProtocolConfig>,
}

/// A simulated device.
pub struct Device {
    id: DeviceId,
    hostname: String,
    inner: Mutex<DeviceInner>,
}

impl Device {
    pub fn new(id: DeviceId, hostname: impl Into<String>) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            inner: Mutex::new(DeviceInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an interface that starts out up. The MAC address is derived from
    /// the device ID and interface index.
    pub fn add_interface(
        &self,
        name: impl Into<String>,
        address: Option<Ipv4Prefix>,
    ) -> Result<(), TopologyError> {
        let name = name.into();
        let mut inner = self.lock();
        if inner.interfaces.iter().any(|interface| interface.name == name) {
            return Err(TopologyError::DuplicateInterface {
                device: self.hostname.clone(),
                interface: name,
            });
        }
        let id = self.id.into_inner().to_be_bytes();
        let index = inner.interfaces.len() as u8;
        inner.interfaces.push(Interface {
            name,
            mac: MacAddress([0x02, id[5], id[6], id[7], 0x00, index]),
            address,
            is_up: true,
            cost: None,
        });
        Ok(())
    }

    pub fn set_interface_cost(&self, name: &str, cost: u32) -> Result<(), TopologyError> {
        let mut inner = self.lock();
        let interface = inner
            .interfaces
            .iter_mut()
            .find(|interface| interface.name == name)
            .ok_or_else(|| self.missing(name))?;
        interface.cost = Some(cost);
        Ok(())
    }

    fn set_interface_up(&self, name: &str, up: bool) -> Result<bool, TopologyError> {
        let mut inner = self.lock();
        let interface = inner
            .interfaces
            .iter_mut()
            .find(|interface| interface.name == name)
            .ok_or_else(|| self.missing(name))?;
        let changed = interface.is_up != up;
        interface.is_up = up;
        Ok(changed)
    }

    fn has_interface(&self, name: &str) -> bool {
        self.lock()
            .interfaces
            .iter()
            .any(|interface| interface.name == name)
    }

    fn is_up(&self, name: &str) -> bool {
        self.lock()
            .interfaces
            .iter()
            .any(|interface| interface.name == name && interface.is_up)
    }

    fn missing(&self, interface: &str) -> TopologyError {
        TopologyError::MissingInterface {
            device: self.hostname.clone(),
            interface: interface.to_string(),
        }
    }

    /// The live far end of the link on `interface`, if both ends are up.
    fn live_link(&self, interface: &str) -> Option<(Arc<Device>, String, ConnectionMetrics)> {
        let (remote, remote_interface, metrics) = {
            let inner = self.lock();
            let local_up = inner
                .interfaces
                .iter()
                .any(|candidate| candidate.name == interface && candidate.is_up);
            if !local_up {
                return None;
            }
            let link = inner.links.get(interface)?;
            (link.remote.upgrade()?, link.remote_interface.clone(), link.metrics)
        };
        // The remote lock is taken only after ours is released.
        if remote.is_up(&remote_interface) {
            Some((remote, remote_interface, metrics))
        } else {
            None
        }
    }
}

impl DeviceContext for Device {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn interface(&self, name: &str) -> Option<Interface> {
        self.lock()
            .interfaces
            .iter()
            .find(|interface| interface.name == name)
            .cloned()
    }

    fn interfaces(&self) -> Vec<Interface> {
        self.lock().interfaces.clone()
    }

    fn connected_device(&self, interface: &str) -> Option<(SharedDevice, String)> {
        self.live_link(interface)
            .map(|(remote, remote_interface, _)| (remote as SharedDevice, remote_interface))
    }

    fn connection_metrics(&self, interface: &str) -> Option<ConnectionMetrics> {
        self.live_link(interface).map(|(_, _, metrics)| metrics)
    }

    fn add_route(&self, route: Route) {
        self.lock().routes.add(route);
    }

    fn clear_routes_by_protocol(&self, protocol: ProtocolType) -> usize {
        self.lock().routes.clear_protocol(protocol)
    }

    fn routing_table(&self) -> RoutingTable {
        self.lock().routes.clone()
    }

    fn protocol_configuration(&self, protocol: ProtocolType) -> Option<ProtocolConfig> {
        self.lock().configurations.get(&protocol).cloned()
    }

    fn set_protocol_configuration(&self, config: ProtocolConfig) {
        self.lock()
            .configurations
            .insert(config.protocol_type(), config);
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("hostname", &self.hostname)
            .finish()
    }
}

/// The set of devices in a simulation and the cables between them.
pub struct Topology {
    devices: FxDashMap<DeviceId, Arc<Device>>,
    next_id: AtomicU64,
    bus: Arc<EventBus>,
    clock: SharedClock,
}

impl Topology {
    pub fn new(bus: Arc<EventBus>, clock: SharedClock) -> Self {
        Self {
            devices: Default::default(),
            next_id: AtomicU64::new(1),
            bus,
            clock,
        }
    }

    pub fn add_device(&self, hostname: impl Into<String>) -> Arc<Device> {
        let id = DeviceId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let device = Arc::new(Device::new(id, hostname));
        self.devices.insert(id, device.clone());
        device
    }

    pub fn device(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices.get(&id).map(|device| device.clone())
    }

    /// All devices, ordered by ID.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<Arc<Device>> = self
            .devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        devices.sort_by_key(|device| device.id);
        devices
    }

    /// Cables `a_interface` on `a` to `b_interface` on `b`.
    pub fn connect(
        &self,
        a: &Arc<Device>,
        a_interface: &str,
        b: &Arc<Device>,
        b_interface: &str,
        metrics: ConnectionMetrics,
    ) -> Result<(), TopologyError> {
        for (device, interface) in [(a, a_interface), (b, b_interface)] {
            if !device.has_interface(interface) {
                return Err(device.missing(interface));
            }
            if device.lock().links.contains_key(interface) {
                return Err(TopologyError::AlreadyConnected {
                    device: device.hostname.clone(),
                    interface: interface.to_string(),
                });
            }
        }
        a.lock().links.insert(
            a_interface.to_string(),
            Link {
                remote: Arc::downgrade(b),
                remote_interface: b_interface.to_string(),
                metrics,
            },
        );
        b.lock().links.insert(
            b_interface.to_string(),
            Link {
                remote: Arc::downgrade(a),
                remote_interface: a_interface.to_string(),
                metrics,
            },
        );
        Ok(())
    }

    /// Unplugs the cable on `interface`, from both ends.
    pub fn disconnect(&self, device: &Arc<Device>, interface: &str) -> bool {
        let link = device.lock().links.remove(interface);
        match link {
            Some(link) => {
                if let Some(remote) = link.remote.upgrade() {
                    remote.lock().links.remove(&link.remote_interface);
                }
                true
            }
            None => false,
        }
    }

    /// Replaces the metrics of the link on `interface`, on both ends.
    pub fn set_link_metrics(
        &self,
        device: &Arc<Device>,
        interface: &str,
        metrics: ConnectionMetrics,
    ) -> Result<(), TopologyError> {
        let remote = {
            let mut inner = device.lock();
            let link = inner
                .links
                .get_mut(interface)
                .ok_or_else(|| device.missing(interface))?;
            link.metrics = metrics;
            (link.remote.clone(), link.remote_interface.clone())
        };
        if let Some(remote_device) = remote.0.upgrade() {
            if let Some(link) = remote_device.lock().links.get_mut(&remote.1) {
                link.metrics = metrics;
            }
        }
        Ok(())
    }

    /// Brings `interface` up or down and announces the change on the bus.
    pub async fn set_interface_state(
        &self,
        device: &Arc<Device>,
        interface: &str,
        up: bool,
    ) -> Result<(), TopologyError> {
        if device.set_interface_up(interface, up)? {
            tracing::info!(
                device = %device.hostname,
                interface,
                "Interface changed state to {}",
                if up { "up" } else { "down" }
            );
            self.bus
                .publish(InterfaceStateChanged {
                    device: device.id,
                    interface: interface.to_string(),
                    up,
                    timestamp: self.clock.now(),
                })
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn prefix(address: &str, length: u8) -> Option<Ipv4Prefix> {
        Some(Ipv4Prefix::new(address.parse().unwrap(), length))
    }

    fn two_routers() -> (Topology, Arc<Device>, Arc<Device>) {
        let topology = Topology::new(EventBus::shared(), ManualClock::shared());
        let r1 = topology.add_device("R1");
        let r2 = topology.add_device("R2");
        r1.add_interface("Gi0/0", prefix("10.0.12.1", 24)).unwrap();
        r2.add_interface("Gi0/0", prefix("10.0.12.2", 24)).unwrap();
        topology
            .connect(&r1, "Gi0/0", &r2, "Gi0/0", ConnectionMetrics::PERFECT)
            .unwrap();
        (topology, r1, r2)
    }

    #[test]
    fn connected_device_sees_far_end() {
        let (_topology, r1, r2) = two_routers();
        let (remote, remote_interface) = r1.connected_device("Gi0/0").unwrap();
        assert_eq!(remote.id(), r2.id());
        assert_eq!(remote_interface, "Gi0/0");
        assert!(r1.connection_metrics("Gi0/0").unwrap().suitable_for_routing);
        assert!(r1.connected_device("Gi0/1").is_none());
    }

    #[tokio::test]
    async fn down_interfaces_hide_the_link() {
        let (topology, r1, r2) = two_routers();
        topology.set_interface_state(&r2, "Gi0/0", false).await.unwrap();
        assert!(r1.connected_device("Gi0/0").is_none());
        assert!(r1.connection_metrics("Gi0/0").is_none());
        topology.set_interface_state(&r2, "Gi0/0", true).await.unwrap();
        assert!(r1.connected_device("Gi0/0").is_some());
    }

    #[test]
    fn cabling_errors() {
        let (topology, r1, r2) = two_routers();
        assert!(matches!(
            topology.connect(&r1, "Gi0/0", &r2, "Gi0/0", ConnectionMetrics::PERFECT),
            Err(TopologyError::AlreadyConnected { .. })
        ));
        assert!(matches!(
            topology.connect(&r1, "Gi0/9", &r2, "Gi0/0", ConnectionMetrics::PERFECT),
            Err(TopologyError::MissingInterface { .. })
        ));
        assert!(topology.disconnect(&r1, "Gi0/0"));
        assert!(r2.connected_device("Gi0/0").is_none());
        assert!(!topology.disconnect(&r1, "Gi0/0"));
    }
}
