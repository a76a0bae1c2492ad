//! Drives simulation time forward.
//!
//! Each tick calls [`update_state`](Protocol::update_state) on every protocol
//! registered to every device, one at a time. A protocol that fails or panics
//! is recorded in the tick's [`TickReport`] and the tick carries on with the
//! rest. Timer and event handler faults a protocol recorded since the last
//! tick are drained into the same report.

use crate::{
    dependency::{DependencyError, DependencyManager},
    device::SharedDevice,
    fault::{panic_message, Fault, FaultOrigin},
    id::DeviceId,
    protocol::{ProtocolError, SharedProtocol},
    protocol_type::ProtocolType,
    shutdown::{ExitStatus, Shutdown},
    time::{SharedClock, SimTime},
};
use futures::FutureExt;
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::time::MissedTickBehavior;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("{device} is not registered with the scheduler")]
    UnknownDevice { device: DeviceId },
    #[error("{device} already runs {protocol}")]
    DuplicateProtocol {
        device: DeviceId,
        protocol: ProtocolType,
    },
    #[error("The protocol is bound to {bound}, not {device}")]
    WrongDevice { device: DeviceId, bound: DeviceId },
    #[error(transparent)]
    Dependency(#[from] DependencyError),
}

/// What happened during one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub at: SimTime,
    /// Protocols whose update completed.
    pub updated: Vec<(DeviceId, ProtocolType)>,
    /// Protocols whose update failed, and timer or handler faults recorded
    /// since the previous tick.
    pub faults: Vec<Fault>,
}

struct DeviceEntry {
    device: SharedDevice,
    protocols: BTreeMap<ProtocolType, SharedProtocol>,
}

pub struct UpdateScheduler {
    clock: SharedClock,
    devices: RwLock<BTreeMap<DeviceId, DeviceEntry>>,
    ticks: AtomicU64,
}

impl UpdateScheduler {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            devices: RwLock::new(BTreeMap::new()),
            ticks: AtomicU64::new(0),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<DeviceId, DeviceEntry>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<DeviceId, DeviceEntry>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a device with no protocols. Adding a device twice keeps its protocols.
    pub fn add_device(&self, device: SharedDevice) {
        self.write()
            .entry(device.id())
            .or_insert_with(|| DeviceEntry {
                device,
                protocols: BTreeMap::new(),
            });
    }

    /// Registers `protocol` to run on `device`. One instance per protocol
    /// type is allowed on a device.
    pub fn register(&self, device: DeviceId, protocol: SharedProtocol) -> Result<(), SchedulerError> {
        if let Some(bound) = protocol.device_id() {
            if bound != device {
                return Err(SchedulerError::WrongDevice { device, bound });
            }
        }
        let mut devices = self.write();
        let entry = devices
            .get_mut(&device)
            .ok_or(SchedulerError::UnknownDevice { device })?;
        let protocol_type = protocol.protocol_type();
        if entry.protocols.contains_key(&protocol_type) {
            return Err(SchedulerError::DuplicateProtocol {
                device,
                protocol: protocol_type,
            });
        }
        entry.protocols.insert(protocol_type, protocol);
        tracing::debug!(device = %device, protocol = %protocol_type, "Protocol registered");
        Ok(())
    }

    /// Stops, disposes, and forgets the `protocol` instance on `device`.
    /// Returns whether there was one.
    pub async fn unregister(&self, device: DeviceId, protocol: ProtocolType) -> bool {
        let removed = self
            .write()
            .get_mut(&device)
            .and_then(|entry| entry.protocols.remove(&protocol));
        match removed {
            Some(instance) => {
                if let Err(e) = instance.dispose().await {
                    tracing::warn!(device = %device, protocol = %protocol, "Dispose failed: {}", e);
                }
                true
            }
            None => false,
        }
    }

    pub fn protocol(&self, device: DeviceId, protocol: ProtocolType) -> Option<SharedProtocol> {
        self.read()
            .get(&device)
            .and_then(|entry| entry.protocols.get(&protocol).cloned())
    }

    pub fn protocols(&self, device: DeviceId) -> Vec<SharedProtocol> {
        self.read()
            .get(&device)
            .map(|entry| entry.protocols.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The protocol types registered on `device`.
    pub fn active_protocols(&self, device: DeviceId) -> BTreeSet<ProtocolType> {
        self.read()
            .get(&device)
            .map(|entry| entry.protocols.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Initializes every registered protocol, device by device, in dependency
    /// order. The protocol set of each device is validated first; problems are
    /// logged but do not prevent bring-up.
    pub async fn initialize_all(
        &self,
        dependencies: &DependencyManager,
    ) -> Result<Vec<Fault>, SchedulerError> {
        let mut plan = Vec::new();
        for (&id, entry) in self.read().iter() {
            let active: BTreeSet<ProtocolType> = entry.protocols.keys().copied().collect();
            let validation = dependencies.validate(&active);
            for error in validation.errors.iter() {
                tracing::warn!(device = %id, "Dependency problem: {}", error);
            }
            for warning in validation.warnings.iter() {
                tracing::debug!(device = %id, "{}", warning);
            }
            for protocol in dependencies.bring_up_order(active)? {
                if let Some(instance) = entry.protocols.get(&protocol) {
                    plan.push((id, entry.device.clone(), instance.clone()));
                }
            }
        }

        let mut faults = Vec::new();
        for (id, device, instance) in plan {
            let protocol = instance.protocol_type();
            if let Err(fault) = isolate(id, protocol, FaultOrigin::Initialize, instance.initialize(device)).await {
                faults.push(fault);
            }
        }
        Ok(faults)
    }

    /// Runs one update pass over every device and protocol.
    pub async fn tick(&self) -> TickReport {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let at = self.clock.now();
        // Snapshot so protocols may register or unregister during the tick.
        let work: Vec<(DeviceId, SharedProtocol)> = self
            .read()
            .iter()
            .flat_map(|(&id, entry)| {
                entry
                    .protocols
                    .values()
                    .map(move |instance| (id, instance.clone()))
            })
            .collect();

        let mut report = TickReport {
            tick,
            at,
            updated: Vec::with_capacity(work.len()),
            faults: Vec::new(),
        };
        for (id, instance) in work {
            let protocol = instance.protocol_type();
            match isolate(id, protocol, FaultOrigin::Update, instance.update_state()).await {
                Ok(()) => report.updated.push((id, protocol)),
                Err(fault) => report.faults.push(fault),
            }
            report.faults.extend(instance.take_faults());
        }
        tracing::debug!(
            tick,
            at = %at,
            updated = report.updated.len(),
            faults = report.faults.len(),
            "Tick complete"
        );
        report
    }

    /// Ticks every `interval` until `shutdown` fires or `max_ticks` ticks have run.
    pub async fn run(
        &self,
        mut shutdown: Shutdown,
        interval: Duration,
        max_ticks: Option<u64>,
    ) -> ExitStatus {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ran = 0;
        loop {
            if max_ticks.map_or(false, |max| ran >= max) {
                return ExitStatus::TickLimit;
            }
            tokio::select! {
                biased;
                status = shutdown.wait_for_shutdown() => return status,
                _ = timer.tick() => {
                    let report = self.tick().await;
                    for fault in report.faults.iter() {
                        tracing::debug!(tick = report.tick, "{}", fault);
                    }
                    ran += 1;
                }
            }
        }
    }

    /// Stops every registered protocol.
    pub async fn stop_all(&self) -> Vec<Fault> {
        let work: Vec<(DeviceId, SharedProtocol)> = self
            .read()
            .iter()
            .flat_map(|(&id, entry)| {
                entry
                    .protocols
                    .values()
                    .map(move |instance| (id, instance.clone()))
            })
            .collect();
        let mut faults = Vec::new();
        for (id, instance) in work {
            let protocol = instance.protocol_type();
            if let Err(fault) = isolate(id, protocol, FaultOrigin::Stop, instance.stop()).await {
                faults.push(fault);
            }
            faults.extend(instance.take_faults());
        }
        faults
    }
}

/// Awaits `work`, turning an error or a panic into a logged [`Fault`].
async fn isolate(
    device: DeviceId,
    protocol: ProtocolType,
    origin: FaultOrigin,
    work: impl Future<Output = Result<(), ProtocolError>>,
) -> Result<(), Fault> {
    let message = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };
    tracing::error!(
        device = %device,
        protocol = %protocol,
        origin = ?origin,
        "Protocol fault: {}",
        message
    );
    Err(Fault {
        device: Some(device),
        protocol: Some(protocol),
        origin,
        message,
    })
}
