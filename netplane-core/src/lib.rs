//! Control-plane protocol emulation for simulated network devices.
//!
//! Protocols running on a simulated device (address resolution, neighbor
//! discovery, routing) share one lifecycle, one neighbor-timeout scheme, and
//! one event bus. This crate provides that framework and a few protocols
//! built on it.
//!
//! # Organization
//! - [`EventBus`] carries typed [`event`]s between protocols and the topology
//! - [`ProtocolBehavior`] is implemented by each concrete protocol and run
//!   inside a [`ProtocolInstance`], which exposes the [`Protocol`] lifecycle
//! - [`UpdateScheduler`] drives every protocol on every device once per tick
//! - [`DependencyManager`] records which protocols need, enrich, or exclude
//!   each other
//! - [`Topology`] is an in-memory set of devices and cables implementing
//!   [`DeviceContext`]
//!
//! # Protocol structure
//!
//! A protocol instance is bound to one device. Each tick it discovers
//! neighbors over the device's links, expires the ones that went quiet for
//! longer than its hold time, runs its periodic work, and recalculates its
//! derived data (routes, neighbor summaries) only when something changed.
//! Background timers run on their own schedule and share the instance's lock
//! with the tick.

pub mod protocols;

pub mod config;
pub use config::{ConfigError, Configuration, ProtocolConfig};

pub mod dependency;
pub use dependency::{DependencyKind, DependencyManager, ProtocolDependency, ValidationResult};

pub mod device;
pub use device::{DeviceContext, SharedDevice};

pub mod event;
pub use event::Event;

pub mod event_bus;
pub use event_bus::EventBus;

pub mod fault;
pub use fault::Fault;

mod id;
pub use id::{DeviceId, SubscriberId};

pub mod neighbor;
pub use neighbor::NeighborId;

pub mod protocol;
pub use protocol::{Protocol, ProtocolBehavior, ProtocolInstance, SharedProtocol};

mod protocol_type;
pub use protocol_type::{ProtocolCategory, ProtocolType, UnknownProtocol};

pub mod scheduler;
pub use scheduler::{TickReport, UpdateScheduler};

pub mod shutdown;
pub use shutdown::{ExitStatus, Shutdown};

pub mod state;
pub use state::{Lifecycle, ProtocolState};

pub mod time;
pub use time::{Clock, ManualClock, SimTime, TokioClock};

pub mod timer;

pub mod topology;
pub use topology::Topology;

pub type FxDashMap<K, V> = dashmap::DashMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
