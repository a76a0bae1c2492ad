//! Events exchanged over the [`EventBus`](crate::EventBus).
//!
//! An event is an immutable record of something that happened. Every event
//! carries the device it concerns (when it concerns one) and the simulation
//! time it happened at, so subscribers can filter cheaply.

use crate::{id::DeviceId, neighbor::NeighborId, protocol_type::ProtocolType, time::SimTime};
use std::fmt::Debug;

pub trait Event: Debug + Send + Sync + 'static {
    /// The device this event concerns, if any.
    fn device(&self) -> Option<DeviceId>;

    /// The protocol this event concerns, if any.
    fn protocol(&self) -> Option<ProtocolType> {
        None
    }

    fn timestamp(&self) -> SimTime;
}

/// An interface went up or down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceStateChanged {
    pub device: DeviceId,
    pub interface: String,
    pub up: bool,
    pub timestamp: SimTime,
}

impl Event for InterfaceStateChanged {
    fn device(&self) -> Option<DeviceId> {
        Some(self.device)
    }

    fn timestamp(&self) -> SimTime {
        self.timestamp
    }
}

/// A protocol's configuration was replaced on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfigurationChanged {
    pub device: DeviceId,
    pub protocol: ProtocolType,
    pub timestamp: SimTime,
}

impl Event for ProtocolConfigurationChanged {
    fn device(&self) -> Option<DeviceId> {
        Some(self.device)
    }

    fn protocol(&self) -> Option<ProtocolType> {
        Some(self.protocol)
    }

    fn timestamp(&self) -> SimTime {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NeighborChange {
    Discovered,
    Lost,
    StateChanged,
}

/// A protocol's neighbor table gained, lost, or updated an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborChanged {
    pub device: DeviceId,
    pub protocol: ProtocolType,
    pub neighbor: NeighborId,
    /// The local interface the neighbor was learned on, when known.
    pub interface: Option<String>,
    pub change: NeighborChange,
    pub timestamp: SimTime,
}

impl Event for NeighborChanged {
    fn device(&self) -> Option<DeviceId> {
        Some(self.device)
    }

    fn protocol(&self) -> Option<ProtocolType> {
        Some(self.protocol)
    }

    fn timestamp(&self) -> SimTime {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketDirection {
    Sent,
    Received,
    Dropped,
}

/// A synthetic protocol packet (advertisement, hello, request) moved through
/// an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketEvent {
    pub device: DeviceId,
    pub protocol: ProtocolType,
    pub interface: String,
    pub direction: PacketDirection,
    /// Protocol-specific packet kind, e.g. `"hello"`.
    pub kind: &'static str,
    pub timestamp: SimTime,
}

impl Event for PacketEvent {
    fn device(&self) -> Option<DeviceId> {
        Some(self.device)
    }

    fn protocol(&self) -> Option<ProtocolType> {
        Some(self.protocol)
    }

    fn timestamp(&self) -> SimTime {
        self.timestamp
    }
}
