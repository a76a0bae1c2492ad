//! The device context protocols run against.
//!
//! A protocol never owns its device. It is handed a [`SharedDevice`] when it
//! initializes and uses it to query interfaces and physical connectivity and
//! to install routes. The physical model behind the trait lives elsewhere;
//! [`topology`](crate::topology) has an in-memory implementation.

use crate::{config::ProtocolConfig, id::DeviceId, protocol_type::ProtocolType};
use std::{fmt::Display, net::Ipv4Addr, str::FromStr, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}{:02x}.{:02x}{:02x}.{:02x}{:02x}", a, b, c, d, e, g)
    }
}

/// An IPv4 address with a prefix length, e.g. `10.0.12.1/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Prefix {
    pub address: Ipv4Addr,
    pub length: u8,
}

impl Ipv4Prefix {
    pub const fn new(address: Ipv4Addr, length: u8) -> Self {
        Self { address, length }
    }

    fn mask(self) -> u32 {
        match self.length {
            0 => 0,
            length => u32::MAX << (32 - length.min(32) as u32),
        }
    }

    /// The prefix with all host bits cleared.
    pub fn network(self) -> Ipv4Prefix {
        Ipv4Prefix {
            address: Ipv4Addr::from(u32::from(self.address) & self.mask()),
            length: self.length,
        }
    }

    pub fn contains(self, address: Ipv4Addr) -> bool {
        u32::from(address) & self.mask() == u32::from(self.address) & self.mask()
    }
}

impl Display for Ipv4Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.length)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("Invalid prefix {0:?}, expected address/length")]
pub struct PrefixParseError(String);

impl FromStr for Ipv4Prefix {
    type Err = PrefixParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PrefixParseError(s.to_string());
        let (address, length) = s.split_once('/').ok_or_else(invalid)?;
        let address = address.parse().map_err(|_| invalid())?;
        let length = length.parse().map_err(|_| invalid())?;
        if length > 32 {
            return Err(invalid());
        }
        Ok(Self::new(address, length))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub mac: MacAddress,
    pub address: Option<Ipv4Prefix>,
    pub is_up: bool,
    /// Routing cost override; protocols fall back to their own default.
    pub cost: Option<u32>,
}

/// What the physical layer reports about the link behind an interface. The
/// thresholds behind the booleans belong to that layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionMetrics {
    pub suitable_for_routing: bool,
    pub suitable_for_realtime: bool,
    pub quality_score: f64,
}

impl ConnectionMetrics {
    pub const PERFECT: ConnectionMetrics = ConnectionMetrics {
        suitable_for_routing: true,
        suitable_for_realtime: true,
        quality_score: 100.0,
    };

    pub const DEGRADED: ConnectionMetrics = ConnectionMetrics {
        suitable_for_routing: false,
        suitable_for_realtime: false,
        quality_score: 20.0,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: Ipv4Prefix,
    pub next_hop: Option<Ipv4Addr>,
    pub interface: String,
    pub protocol: ProtocolType,
    pub metric: u32,
    pub admin_distance: u8,
}

impl Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}/{}]", self.prefix, self.admin_distance, self.metric)?;
        match self.next_hop {
            Some(next_hop) => write!(f, " via {}, {}", next_hop, self.interface),
            None => write!(f, " is directly connected, {}", self.interface),
        }
    }
}

/// Routes installed on a device by its protocols.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `route`, replacing a route from the same protocol for the
    /// same prefix and next hop.
    pub fn add(&mut self, route: Route) {
        match self.routes.iter_mut().find(|existing| {
            existing.protocol == route.protocol
                && existing.prefix == route.prefix
                && existing.next_hop == route.next_hop
        }) {
            Some(existing) => *existing = route,
            None => self.routes.push(route),
        }
    }

    /// Removes every route installed by `protocol`. Returns how many were removed.
    pub fn clear_protocol(&mut self, protocol: ProtocolType) -> usize {
        let before = self.routes.len();
        self.routes.retain(|route| route.protocol != protocol);
        before - self.routes.len()
    }

    /// The best route for `destination`: longest prefix, then lowest
    /// administrative distance, then lowest metric.
    pub fn lookup(&self, destination: Ipv4Addr) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|route| route.prefix.contains(destination))
            .min_by(|a, b| {
                b.prefix
                    .length
                    .cmp(&a.prefix.length)
                    .then(a.admin_distance.cmp(&b.admin_distance))
                    .then(a.metric.cmp(&b.metric))
            })
    }

    pub fn by_protocol(&self, protocol: ProtocolType) -> impl Iterator<Item = &Route> {
        self.routes
            .iter()
            .filter(move |route| route.protocol == protocol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Read/write access to a device, as consumed by protocols.
pub trait DeviceContext: Send + Sync + 'static {
    fn id(&self) -> DeviceId;

    fn hostname(&self) -> String;

    fn interface(&self, name: &str) -> Option<Interface>;

    fn interfaces(&self) -> Vec<Interface>;

    /// The device and remote interface at the other end of the link on
    /// `interface`, if one is physically connected and both ends are up.
    fn connected_device(&self, interface: &str) -> Option<(SharedDevice, String)>;

    /// Link quality behind `interface`, if it is connected.
    fn connection_metrics(&self, interface: &str) -> Option<ConnectionMetrics>;

    fn add_route(&self, route: Route);

    fn clear_routes_by_protocol(&self, protocol: ProtocolType) -> usize;

    fn routing_table(&self) -> RoutingTable;

    fn protocol_configuration(&self, protocol: ProtocolType) -> Option<ProtocolConfig>;

    fn set_protocol_configuration(&self, config: ProtocolConfig);
}

pub type SharedDevice = Arc<dyn DeviceContext>;

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str, length: u8, protocol: ProtocolType, metric: u32) -> Route {
        Route {
            prefix: Ipv4Prefix::new(prefix.parse().unwrap(), length),
            next_hop: Some("10.0.0.2".parse().unwrap()),
            interface: "Gi0/0".into(),
            protocol,
            metric,
            admin_distance: protocol.admin_distance().unwrap_or(1),
        }
    }

    #[test]
    fn prefix_parsing() {
        let prefix: Ipv4Prefix = "192.168.3.1/24".parse().unwrap();
        assert_eq!(prefix, Ipv4Prefix::new(Ipv4Addr::new(192, 168, 3, 1), 24));
        assert!("192.168.3.1".parse::<Ipv4Prefix>().is_err());
        assert!("192.168.3.1/33".parse::<Ipv4Prefix>().is_err());
        assert!("192.168.3/24".parse::<Ipv4Prefix>().is_err());
    }

    #[test]
    fn prefix_math() {
        let prefix = Ipv4Prefix::new("10.0.12.1".parse().unwrap(), 24);
        assert_eq!(prefix.network().to_string(), "10.0.12.0/24");
        assert!(prefix.contains("10.0.12.200".parse().unwrap()));
        assert!(!prefix.contains("10.0.13.1".parse().unwrap()));
        assert!(Ipv4Prefix::new(Ipv4Addr::UNSPECIFIED, 0).contains("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn lookup_prefers_longest_prefix_then_distance() {
        let mut table = RoutingTable::new();
        table.add(route("10.0.0.0", 8, ProtocolType::Rip, 1));
        table.add(route("10.1.0.0", 16, ProtocolType::Rip, 3));
        table.add(route("10.1.0.0", 16, ProtocolType::Ospf, 20));
        let best = table.lookup("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(best.protocol, ProtocolType::Ospf);
        assert_eq!(table.clear_protocol(ProtocolType::Rip), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn add_replaces_same_protocol_route() {
        let mut table = RoutingTable::new();
        table.add(route("10.1.0.0", 16, ProtocolType::Ospf, 20));
        table.add(route("10.1.0.0", 16, ProtocolType::Ospf, 30));
        assert_eq!(table.len(), 1);
        assert_eq!(table.iter().next().unwrap().metric, 30);
    }
}
