//! Strongly-typed per-protocol configuration.
//!
//! The framework only ever handles [`ProtocolConfig`], a tagged union keyed by
//! protocol type. Each concrete protocol converts it into its own struct and
//! validates it before anything is mutated.

use crate::protocol_type::ProtocolType;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, net::Ipv4Addr, time::Duration};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} = {value} is out of range ({min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("A {found} configuration cannot be applied to {expected}")]
    WrongProtocol {
        expected: ProtocolType,
        found: ProtocolType,
    },
}

pub fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

/// The capability every typed configuration shares.
pub trait Configuration: Debug + Clone + Send + Sync + 'static {
    fn validate(&self) -> Result<(), ConfigError>;

    fn is_enabled(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArpConfig {
    pub enabled: bool,
    /// How long a learned entry lives without being refreshed.
    pub entry_timeout_secs: u64,
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            entry_timeout_secs: 14_400,
        }
    }
}

impl ArpConfig {
    pub fn entry_timeout(&self) -> Duration {
        Duration::from_secs(self.entry_timeout_secs)
    }
}

impl Configuration for ArpConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_range("entry_timeout_secs", self.entry_timeout_secs, 60, 86_400)
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Configuration shared by the CDP and LLDP discovery protocols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub advertisement_interval_secs: u64,
    pub hold_time_secs: u64,
    /// Interfaces discovery is disabled on.
    pub disabled_interfaces: Vec<String>,
}

impl DiscoveryConfig {
    pub fn cdp() -> Self {
        Self {
            enabled: true,
            advertisement_interval_secs: 60,
            hold_time_secs: 180,
            disabled_interfaces: Vec::new(),
        }
    }

    pub fn lldp() -> Self {
        Self {
            enabled: true,
            advertisement_interval_secs: 30,
            hold_time_secs: 120,
            disabled_interfaces: Vec::new(),
        }
    }

    pub fn advertisement_interval(&self) -> Duration {
        Duration::from_secs(self.advertisement_interval_secs)
    }

    pub fn hold_time(&self) -> Duration {
        Duration::from_secs(self.hold_time_secs)
    }

    pub fn is_enabled_on(&self, interface: &str) -> bool {
        !self
            .disabled_interfaces
            .iter()
            .any(|disabled| disabled == interface)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::cdp()
    }
}

impl Configuration for DiscoveryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "advertisement_interval_secs",
            self.advertisement_interval_secs,
            5,
            254,
        )?;
        check_range("hold_time_secs", self.hold_time_secs, 10, 65_535)?;
        if self.hold_time_secs <= self.advertisement_interval_secs {
            return Err(ConfigError::Invalid {
                field: "hold_time_secs",
                reason: format!(
                    "hold time {}s must exceed the advertisement interval {}s",
                    self.hold_time_secs, self.advertisement_interval_secs
                ),
            });
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OspfConfig {
    pub enabled: bool,
    /// When unset, the highest interface address of the device is used.
    pub router_id: Option<Ipv4Addr>,
    pub area: u32,
    pub hello_interval_secs: u64,
    pub dead_interval_secs: u64,
    /// Cost of interfaces that do not set one.
    pub default_cost: u32,
}

impl Default for OspfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            router_id: None,
            area: 0,
            hello_interval_secs: 10,
            dead_interval_secs: 40,
            default_cost: 10,
        }
    }
}

impl OspfConfig {
    pub fn hello_interval(&self) -> Duration {
        Duration::from_secs(self.hello_interval_secs)
    }

    pub fn dead_interval(&self) -> Duration {
        Duration::from_secs(self.dead_interval_secs)
    }
}

impl Configuration for OspfConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(router_id) = self.router_id {
            if router_id.is_unspecified() || router_id.is_broadcast() {
                return Err(ConfigError::Invalid {
                    field: "router_id",
                    reason: format!("{} is not a usable router ID", router_id),
                });
            }
        }
        check_range("hello_interval_secs", self.hello_interval_secs, 1, 65_535)?;
        check_range("dead_interval_secs", self.dead_interval_secs, 1, 65_535)?;
        if self.dead_interval_secs <= self.hello_interval_secs {
            return Err(ConfigError::Invalid {
                field: "dead_interval_secs",
                reason: format!(
                    "dead interval {}s must exceed the hello interval {}s",
                    self.dead_interval_secs, self.hello_interval_secs
                ),
            });
        }
        check_range("default_cost", self.default_cost as u64, 1, 65_535)
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// A configuration for any protocol, tagged by protocol type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "UPPERCASE")]
pub enum ProtocolConfig {
    Arp(ArpConfig),
    Cdp(DiscoveryConfig),
    Lldp(DiscoveryConfig),
    Ospf(OspfConfig),
}

impl ProtocolConfig {
    pub fn protocol_type(&self) -> ProtocolType {
        match self {
            ProtocolConfig::Arp(_) => ProtocolType::Arp,
            ProtocolConfig::Cdp(_) => ProtocolType::Cdp,
            ProtocolConfig::Lldp(_) => ProtocolType::Lldp,
            ProtocolConfig::Ospf(_) => ProtocolType::Ospf,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            ProtocolConfig::Arp(config) => config.is_enabled(),
            ProtocolConfig::Cdp(config) | ProtocolConfig::Lldp(config) => config.is_enabled(),
            ProtocolConfig::Ospf(config) => config.is_enabled(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ProtocolConfig::Arp(config) => config.validate(),
            ProtocolConfig::Cdp(config) | ProtocolConfig::Lldp(config) => config.validate(),
            ProtocolConfig::Ospf(config) => config.validate(),
        }
    }

    /// The error returned when this configuration is offered to `expected`.
    pub fn mismatch(&self, expected: ProtocolType) -> ConfigError {
        ConfigError::WrongProtocol {
            expected,
            found: self.protocol_type(),
        }
    }
}
