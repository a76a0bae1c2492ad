use crate::protocol_type::ProtocolType;
use const_fnv1a_hash::fnv1a_hash_64;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Identifies a simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(u64);

impl DeviceId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Gets the underlying ID number.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl From<u64> for DeviceId {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device-{}", self.0)
    }
}

/// The identity an event handler is registered under on the
/// [`EventBus`](crate::EventBus). Used for targeted unsubscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Creates a subscriber ID with the given number.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Creates a pseudorandom ID by hashing the string identifier.
    pub const fn from_string(string: &'static str) -> Self {
        Self(fnv1a_hash_64(string.as_bytes(), None))
    }

    /// Same as [`from_string`](Self::from_string) for names built at runtime.
    pub fn from_name(name: &str) -> Self {
        Self(fnv1a_hash_64(name.as_bytes(), None))
    }

    /// The identity a protocol instance subscribes under.
    pub fn for_protocol(device: DeviceId, protocol: ProtocolType) -> Self {
        Self::from_name(&format!("{}/{}", device, protocol))
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_ids_are_stable() {
        const CLI: SubscriberId = SubscriberId::from_string("cli");
        assert_eq!(CLI, SubscriberId::from_name("cli"));
        assert_ne!(CLI, SubscriberId::from_name("monitor"));
    }

    #[test]
    fn protocol_subscribers_differ_per_device() {
        let a = SubscriberId::for_protocol(DeviceId::new(1), ProtocolType::Ospf);
        let b = SubscriberId::for_protocol(DeviceId::new(2), ProtocolType::Ospf);
        let c = SubscriberId::for_protocol(DeviceId::new(1), ProtocolType::Cdp);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
