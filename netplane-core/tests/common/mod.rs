//! A scriptable protocol used to observe the framework from the outside.

#![allow(dead_code)]

use netplane_core::{
    config::{ArpConfig, ConfigError, ProtocolConfig},
    device::{ConnectionMetrics, Ipv4Prefix},
    protocol::{HookContext, HookError},
    timer::TimerSpec,
    topology::Device,
    EventBus, ManualClock, NeighborId, ProtocolBehavior, ProtocolType, SimTime, Topology,
};
use std::{
    any::Any,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// Knobs shared between a test and the [`Puppet`] it drives.
#[derive(Clone, Default)]
pub struct Script {
    /// Neighbors the puppet hears from on every tick.
    pub heard: Arc<Mutex<Vec<&'static str>>>,
    pub panic_on_update: Arc<AtomicBool>,
    pub fail_on_update: Arc<AtomicBool>,
    pub calculations: Arc<AtomicUsize>,
    pub removed: Arc<Mutex<Vec<NeighborId>>>,
    /// Protocols in the order they were initialized.
    pub initialized: Arc<Mutex<Vec<ProtocolType>>>,
    /// Period of a background `beat` timer that sends one packet per firing.
    pub beat: Option<Duration>,
    pub fail_on_beat: Arc<AtomicBool>,
    pub beats: Arc<AtomicUsize>,
}

impl Script {
    pub fn hear(&self, neighbors: &[&'static str]) {
        *self.heard.lock().unwrap() = neighbors.to_vec();
    }

    pub fn calculations(&self) -> usize {
        self.calculations.load(Ordering::SeqCst)
    }
}

/// Pretends to be `protocol`, configured with an [`ArpConfig`].
pub struct Puppet {
    protocol: ProtocolType,
    script: Script,
}

impl Puppet {
    pub fn new(protocol: ProtocolType, script: Script) -> Self {
        Self { protocol, script }
    }
}

impl ProtocolBehavior for Puppet {
    type Config = ArpConfig;

    fn protocol_type(&self) -> ProtocolType {
        self.protocol
    }

    fn default_config(&self) -> ArpConfig {
        ArpConfig::default()
    }

    fn config_from(&self, config: ProtocolConfig) -> Result<ArpConfig, ConfigError> {
        match config {
            ProtocolConfig::Arp(config) => Ok(config),
            other => Err(other.mismatch(self.protocol)),
        }
    }

    fn config_into(&self, config: &ArpConfig) -> ProtocolConfig {
        ProtocolConfig::Arp(config.clone())
    }

    fn on_initialize(&mut self, _config: &ArpConfig, _ctx: &mut HookContext<'_>) {
        self.script.initialized.lock().unwrap().push(self.protocol);
    }

    fn timers(&self, _config: &ArpConfig) -> Vec<TimerSpec> {
        self.script
            .beat
            .map(|period| vec![TimerSpec::new("beat", period)])
            .unwrap_or_default()
    }

    fn on_timer(
        &mut self,
        _timer: &'static str,
        _config: &ArpConfig,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        self.script.beats.fetch_add(1, Ordering::SeqCst);
        ctx.packet_sent("Gi0/0", "beat");
        if self.script.fail_on_beat.load(Ordering::SeqCst) {
            return Err(HookError::new("beat refused"));
        }
        Ok(())
    }

    fn hold_time(&self, config: &ArpConfig) -> Option<Duration> {
        Some(config.entry_timeout())
    }

    fn update_neighbors(
        &mut self,
        _config: &ArpConfig,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        if self.script.panic_on_update.load(Ordering::SeqCst) {
            panic!("puppet exploded");
        }
        if self.script.fail_on_update.load(Ordering::SeqCst) {
            return Err(HookError::new("puppet refused"));
        }
        let heard = self.script.heard.lock().unwrap().clone();
        for neighbor in heard {
            ctx.neighbor_heard(&NeighborId::from(neighbor), "Gi0/0");
        }
        Ok(())
    }

    fn run_protocol_calculation(
        &mut self,
        _config: &ArpConfig,
        _ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        self.script.calculations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_neighbor_removed(
        &mut self,
        neighbor: &NeighborId,
        _ctx: &mut HookContext<'_>,
    ) -> Option<String> {
        self.script.removed.lock().unwrap().push(neighbor.clone());
        Some("Gi0/0".to_string())
    }

    fn snapshot(&self, now: SimTime) -> Box<dyn Any + Send> {
        Box::new(now)
    }
}

pub struct Lab {
    pub clock: Arc<ManualClock>,
    pub bus: Arc<EventBus>,
    pub topology: Topology,
}

impl Lab {
    pub fn new() -> Self {
        let clock = ManualClock::shared();
        let bus = EventBus::shared();
        let topology = Topology::new(bus.clone(), clock.clone());
        Self {
            clock,
            bus,
            topology,
        }
    }

    /// A router with one addressed interface, `Gi0/0`.
    pub fn router(&self, hostname: &str, address: &str) -> Arc<Device> {
        let device = self.topology.add_device(hostname);
        device
            .add_interface("Gi0/0", Some(Ipv4Prefix::new(address.parse().unwrap(), 24)))
            .unwrap();
        device
    }

    /// Two routers cabled together on `Gi0/0`.
    pub fn pair(&self) -> (Arc<Device>, Arc<Device>) {
        let r1 = self.router("R1", "10.0.12.1");
        let r2 = self.router("R2", "10.0.12.2");
        self.topology
            .connect(&r1, "Gi0/0", &r2, "Gi0/0", ConnectionMetrics::PERFECT)
            .unwrap();
        (r1, r2)
    }
}
