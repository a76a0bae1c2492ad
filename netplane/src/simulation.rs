use anyhow::{anyhow, Context};
use netplane_core::{
    device::{Ipv4Prefix, Route},
    protocols,
    time::SharedClock,
    topology::Device,
    DependencyManager, DeviceContext, EventBus, ExitStatus, Lifecycle, Protocol, ProtocolType,
    Shutdown, TokioClock, Topology, UpdateScheduler,
};
use std::{
    collections::BTreeSet,
    fmt::Display,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

/// Everything one simulation run needs: the devices and cables, the
/// scheduler driving their protocols, and the dependency graph the protocol
/// sets are checked against.
pub struct Simulation {
    bus: Arc<EventBus>,
    clock: SharedClock,
    topology: Topology,
    scheduler: UpdateScheduler,
    dependencies: DependencyManager,
    shutdown: Mutex<Shutdown>,
    interval: Duration,
}

impl Simulation {
    /// Creates an empty simulation that ticks once per second of runtime.
    pub fn new(dependencies: DependencyManager) -> Self {
        let bus = EventBus::shared();
        let clock: SharedClock = Arc::new(TokioClock::new());
        Self {
            topology: Topology::new(bus.clone(), clock.clone()),
            scheduler: UpdateScheduler::new(clock.clone()),
            bus,
            clock,
            dependencies,
            shutdown: Mutex::new(Shutdown::new()),
            interval: Duration::from_secs(1),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }

    pub fn dependencies(&self) -> &DependencyManager {
        &self.dependencies
    }

    /// A handle that ends the current and every later run when shut down.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Adds a device with the given `(interface, address/length)` pairs.
    pub fn router(
        &self,
        hostname: &str,
        interfaces: &[(&str, &str)],
    ) -> anyhow::Result<Arc<Device>> {
        let device = self.topology.add_device(hostname);
        for (name, prefix) in interfaces {
            let prefix: Ipv4Prefix = prefix
                .parse()
                .with_context(|| format!("Bad address for {} {}", hostname, name))?;
            device.add_interface(*name, Some(prefix))?;
        }
        Ok(device)
    }

    pub fn device(&self, hostname: &str) -> Option<Arc<Device>> {
        self.topology
            .devices()
            .into_iter()
            .find(|device| device.hostname() == hostname)
    }

    /// Registers a default-configured instance of each protocol on `device`.
    /// Gaps in the protocol set are logged, not refused.
    pub fn install(&self, device: &Arc<Device>, set: &[ProtocolType]) -> anyhow::Result<()> {
        let requested: BTreeSet<ProtocolType> = set.iter().copied().collect();
        let validation = self.dependencies.validate(&requested);
        for error in validation.errors.iter() {
            tracing::warn!(device = %device.hostname(), "{}", error);
        }

        self.scheduler.add_device(device.clone());
        for &protocol in set {
            let instance = protocols::create(protocol, self.bus.clone(), self.clock.clone())
                .ok_or_else(|| anyhow!("{} is not implemented", protocol))?;
            self.scheduler.register(device.id(), instance)?;
        }
        Ok(())
    }

    /// Initializes every installed protocol in dependency order.
    pub async fn start(&self) -> anyhow::Result<()> {
        let faults = self.scheduler.initialize_all(&self.dependencies).await?;
        for fault in faults {
            tracing::warn!("{}", fault);
        }
        Ok(())
    }

    /// Runs `ticks` ticks, or fewer if the simulation is shut down.
    pub async fn run(&self, ticks: u64) -> ExitStatus {
        let shutdown = {
            let mut shutdown = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(status) = shutdown.poll_status() {
                return status;
            }
            shutdown.clone()
        };
        self.scheduler.run(shutdown, self.interval, Some(ticks)).await
    }

    /// Stops every protocol.
    pub async fn finish(&self) {
        for fault in self.scheduler.stop_all().await {
            tracing::warn!("{}", fault);
        }
    }

    /// One summary per device, ordered by device.
    pub fn summary(&self) -> Vec<DeviceSummary> {
        self.topology
            .devices()
            .into_iter()
            .map(|device| DeviceSummary {
                hostname: device.hostname(),
                protocols: self
                    .scheduler
                    .protocols(device.id())
                    .into_iter()
                    .map(|instance| {
                        let neighbors = instance
                            .state()
                            .map(|state| state.neighbors.len())
                            .unwrap_or(0);
                        (instance.protocol_type(), instance.lifecycle(), neighbors)
                    })
                    .collect(),
                routes: device.routing_table().iter().cloned().collect(),
            })
            .collect()
    }
}

/// What a device ended a run with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub hostname: String,
    /// Each protocol with its lifecycle state and neighbor count.
    pub protocols: Vec<(ProtocolType, Lifecycle, usize)>,
    pub routes: Vec<Route>,
}

impl Display for DeviceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.hostname)?;
        for (protocol, lifecycle, neighbors) in self.protocols.iter() {
            writeln!(f, "  {:<6} {:?}, {} neighbors", protocol, lifecycle, neighbors)?;
        }
        for route in self.routes.iter() {
            writeln!(f, "  {}", route)?;
        }
        Ok(())
    }
}
