//! The closed set of protocol kinds a device can run.

use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

/// Identifies a protocol kind. Used as the key for dependency edges, state
/// lookup, and event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProtocolType {
    Arp,
    Rip,
    Ospf,
    Eigrp,
    Bgp,
    IsIs,
    Cdp,
    Lldp,
    Stp,
    Hsrp,
    Vrrp,
    Ssh,
    Telnet,
    Snmp,
}

/// Broad grouping of protocol kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolCategory {
    AddressResolution,
    Routing,
    Discovery,
    Switching,
    Redundancy,
    Management,
}

impl ProtocolType {
    pub const ALL: [ProtocolType; 14] = [
        ProtocolType::Arp,
        ProtocolType::Rip,
        ProtocolType::Ospf,
        ProtocolType::Eigrp,
        ProtocolType::Bgp,
        ProtocolType::IsIs,
        ProtocolType::Cdp,
        ProtocolType::Lldp,
        ProtocolType::Stp,
        ProtocolType::Hsrp,
        ProtocolType::Vrrp,
        ProtocolType::Ssh,
        ProtocolType::Telnet,
        ProtocolType::Snmp,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            ProtocolType::Arp => "ARP",
            ProtocolType::Rip => "RIP",
            ProtocolType::Ospf => "OSPF",
            ProtocolType::Eigrp => "EIGRP",
            ProtocolType::Bgp => "BGP",
            ProtocolType::IsIs => "IS-IS",
            ProtocolType::Cdp => "CDP",
            ProtocolType::Lldp => "LLDP",
            ProtocolType::Stp => "STP",
            ProtocolType::Hsrp => "HSRP",
            ProtocolType::Vrrp => "VRRP",
            ProtocolType::Ssh => "SSH",
            ProtocolType::Telnet => "Telnet",
            ProtocolType::Snmp => "SNMP",
        }
    }

    pub const fn category(self) -> ProtocolCategory {
        match self {
            ProtocolType::Arp => ProtocolCategory::AddressResolution,
            ProtocolType::Rip
            | ProtocolType::Ospf
            | ProtocolType::Eigrp
            | ProtocolType::Bgp
            | ProtocolType::IsIs => ProtocolCategory::Routing,
            ProtocolType::Cdp | ProtocolType::Lldp => ProtocolCategory::Discovery,
            ProtocolType::Stp => ProtocolCategory::Switching,
            ProtocolType::Hsrp | ProtocolType::Vrrp => ProtocolCategory::Redundancy,
            ProtocolType::Ssh | ProtocolType::Telnet | ProtocolType::Snmp => {
                ProtocolCategory::Management
            }
        }
    }

    /// Administrative distance of routes installed by this protocol, if it
    /// installs any.
    pub const fn admin_distance(self) -> Option<u8> {
        match self {
            ProtocolType::Eigrp => Some(90),
            ProtocolType::Ospf => Some(110),
            ProtocolType::IsIs => Some(115),
            ProtocolType::Rip => Some(120),
            ProtocolType::Bgp => Some(20),
            _ => None,
        }
    }
}

impl Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("Unknown protocol: {0}")]
pub struct UnknownProtocol(pub String);

impl FromStr for ProtocolType {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        ProtocolType::ALL
            .into_iter()
            .find(|protocol| {
                protocol
                    .name()
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .collect::<String>()
                    .eq_ignore_ascii_case(&normalized)
            })
            .ok_or_else(|| UnknownProtocol(s.to_string()))
    }
}
