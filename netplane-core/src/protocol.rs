//! The protocol lifecycle and the hooks concrete protocols implement.
//!
//! A concrete protocol implements [`ProtocolBehavior`]: its algorithm-specific
//! hooks (neighbor discovery, timer processing, the core calculation, neighbor
//! removal) and a strongly-typed configuration. [`ProtocolInstance`] wraps a
//! behavior in the shared state machine and implements [`Protocol`], the
//! object-safe lifecycle the scheduler and monitoring code use:
//!
//! - [`initialize`](Protocol::initialize) binds the device, imports any
//!   configuration the device already holds, subscribes to events and starts
//!   background timers. Calling it again is a no-op.
//! - [`update_state`](Protocol::update_state) runs once per tick: discover
//!   neighbors, expire stale ones, process timers, and recalculate if the
//!   state is dirty.
//! - [`apply_configuration`](Protocol::apply_configuration) validates and
//!   swaps in a new configuration, restarting timers when their schedule
//!   changed.
//! - [`stop`](Protocol::stop) cancels timers and unsubscribes; it may be
//!   called any number of times.
//! - [`dispose`](Protocol::dispose) is terminal.
//!
//! Every hook runs under one mutex per instance, shared by the tick path,
//! background timers and event handlers. Events a hook wants to publish are
//! queued on its [`HookContext`] and published after the mutex is released,
//! so a handler may call back into the same protocol.

use crate::{
    config::{ConfigError, Configuration, ProtocolConfig},
    device::SharedDevice,
    event::{
        Event, InterfaceStateChanged, NeighborChange, NeighborChanged, PacketDirection,
        PacketEvent, ProtocolConfigurationChanged,
    },
    event_bus::{EventBus, PendingEvent},
    fault::{panic_message, Fault, FaultOrigin},
    id::{DeviceId, SubscriberId},
    neighbor::{sweep_expired, NeighborId},
    protocol_type::ProtocolType,
    state::{Lifecycle, ProtocolState, StateSnapshot},
    time::{SharedClock, SimTime},
    timer::{TimerSet, TimerSpec},
};
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("The protocol instance has been disposed")]
    Disposed,
    #[error("The protocol instance has not been initialized")]
    NotInitialized,
    #[error("Configuration rejected: {0}")]
    Configuration(#[from] ConfigError),
    #[error("{protocol} failed: {reason}")]
    Hook {
        protocol: ProtocolType,
        reason: String,
    },
}

/// An error raised by a protocol hook.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HookError(String);

impl HookError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Performance counters kept for every protocol instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolMetrics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub error_count: u64,
    pub calculations: u64,
    pub last_calculation_time: Duration,
    pub total_calculation_time: Duration,
}

impl ProtocolMetrics {
    fn record_calculation(&mut self, took: Duration) {
        self.calculations += 1;
        self.last_calculation_time = took;
        self.total_calculation_time += took;
    }
}

/// What a hook gets to work with: the device, the current time, the shared
/// state and counters, and a queue of events to publish once the hook returns.
pub struct HookContext<'a> {
    protocol: ProtocolType,
    device: &'a SharedDevice,
    now: SimTime,
    pub state: &'a mut ProtocolState,
    pub metrics: &'a mut ProtocolMetrics,
    outbox: &'a mut Vec<PendingEvent>,
}

impl<'a> HookContext<'a> {
    pub fn device(&self) -> &SharedDevice {
        self.device
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    /// Queues `event` for publication after the hook returns.
    pub fn publish<E: Event>(&mut self, event: E) {
        self.outbox.push(PendingEvent::new(event));
    }

    /// Records activity from `neighbor` in the shared ledger. A neighbor not
    /// seen before is announced as discovered. Returns whether it was new.
    pub fn neighbor_heard(&mut self, neighbor: &NeighborId, interface: &str) -> bool {
        let discovered = self.state.record_neighbor_activity(neighbor.clone(), self.now);
        if discovered {
            tracing::info!(
                device = %self.device.hostname(),
                protocol = %self.protocol,
                interface,
                "Neighbor {} discovered",
                neighbor
            );
            self.neighbor_event(neighbor, Some(interface.to_string()), NeighborChange::Discovered);
        }
        discovered
    }

    /// Announces that the details of a known neighbor changed.
    pub fn neighbor_updated(&mut self, neighbor: &NeighborId, interface: &str) {
        self.state.mark_changed();
        self.neighbor_event(neighbor, Some(interface.to_string()), NeighborChange::StateChanged);
    }

    /// Forgets `neighbor` without waiting for its hold time and announces it
    /// as lost. The caller drops it from its own tables.
    pub fn neighbor_lost(&mut self, neighbor: &NeighborId, interface: &str) {
        self.state.remove_neighbor(neighbor);
        self.state.mark_changed();
        tracing::info!(
            device = %self.device.hostname(),
            protocol = %self.protocol,
            interface,
            "Neighbor {} lost",
            neighbor
        );
        self.neighbor_event(neighbor, Some(interface.to_string()), NeighborChange::Lost);
    }

    fn neighbor_event(
        &mut self,
        neighbor: &NeighborId,
        interface: Option<String>,
        change: NeighborChange,
    ) {
        let event = NeighborChanged {
            device: self.device.id(),
            protocol: self.protocol,
            neighbor: neighbor.clone(),
            interface,
            change,
            timestamp: self.now,
        };
        self.publish(event);
    }

    pub fn packet_sent(&mut self, interface: &str, kind: &'static str) {
        self.metrics.packets_sent += 1;
        self.packet(interface, kind, PacketDirection::Sent);
    }

    pub fn packet_received(&mut self, interface: &str, kind: &'static str) {
        self.metrics.packets_received += 1;
        self.packet(interface, kind, PacketDirection::Received);
    }

    pub fn packet_dropped(&mut self, interface: &str, kind: &'static str) {
        self.metrics.packets_dropped += 1;
        self.packet(interface, kind, PacketDirection::Dropped);
    }

    fn packet(&mut self, interface: &str, kind: &'static str, direction: PacketDirection) {
        let event = PacketEvent {
            device: self.device.id(),
            protocol: self.protocol,
            interface: interface.to_string(),
            direction,
            kind,
            timestamp: self.now,
        };
        self.publish(event);
    }
}

/// The algorithm-specific part of a protocol.
pub trait ProtocolBehavior: Send + 'static {
    type Config: Configuration;

    fn protocol_type(&self) -> ProtocolType;

    fn default_config(&self) -> Self::Config;

    /// Extracts this protocol's configuration from the tagged union.
    fn config_from(&self, config: ProtocolConfig) -> Result<Self::Config, ConfigError>;

    fn config_into(&self, config: &Self::Config) -> ProtocolConfig;

    /// Builds the initial state when the protocol initializes on a device.
    fn create_state(&self) -> ProtocolState {
        ProtocolState::new()
    }

    /// One-time setup after the device is bound.
    fn on_initialize(&mut self, _config: &Self::Config, _ctx: &mut HookContext<'_>) {}

    /// How long a neighbor may stay silent before it is expired. `None`
    /// disables the sweep.
    fn hold_time(&self, config: &Self::Config) -> Option<Duration>;

    /// Discovers reachable neighbors and refreshes their last-seen times.
    /// Must mark the state changed on any table change.
    fn update_neighbors(
        &mut self,
        config: &Self::Config,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError>;

    /// Tick-driven periodic behavior, keyed off time elapsed since the last send.
    fn process_timers(
        &mut self,
        _config: &Self::Config,
        _ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Protocol-specific reason to recalculate even if the state is clean.
    fn topology_changed(&self) -> bool {
        false
    }

    /// The protocol's core algorithm. Runs when the state is dirty.
    fn run_protocol_calculation(
        &mut self,
        config: &Self::Config,
        ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError>;

    /// Drops `neighbor` from the protocol's own tables and anything derived
    /// from it. Returns the interface it was learned on, if known.
    fn on_neighbor_removed(&mut self, neighbor: &NeighborId, ctx: &mut HookContext<'_>)
        -> Option<String>;

    /// Background timers to run while the protocol is enabled.
    fn timers(&self, _config: &Self::Config) -> Vec<TimerSpec> {
        Vec::new()
    }

    fn on_timer(
        &mut self,
        _timer: &'static str,
        _config: &Self::Config,
        _ctx: &mut HookContext<'_>,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Whether moving from `old` to `new` needs the background timers restarted.
    fn requires_restart(&self, old: &Self::Config, new: &Self::Config) -> bool {
        self.timers(old) != self.timers(new)
    }

    /// Live-update hook, run after a new configuration is swapped in.
    fn on_configuration_applied(
        &mut self,
        _old: &Self::Config,
        _new: &Self::Config,
        _ctx: &mut HookContext<'_>,
    ) {
    }

    /// Releases whatever `on_initialize` acquired.
    fn on_stop(&mut self, _config: &Self::Config, _ctx: &mut HookContext<'_>) {}

    /// A protocol-specific snapshot for [`typed_state`](dyn Protocol::typed_state).
    fn snapshot(&self, now: SimTime) -> Box<dyn Any + Send>;
}

/// The lifecycle every protocol instance exposes.
#[async_trait::async_trait]
pub trait Protocol: Send + Sync + 'static {
    fn protocol_type(&self) -> ProtocolType;

    /// The device the instance is bound to, once initialized.
    fn device_id(&self) -> Option<DeviceId>;

    async fn initialize(&self, device: SharedDevice) -> Result<(), ProtocolError>;

    async fn update_state(&self) -> Result<(), ProtocolError>;

    /// Expires neighbors whose hold time has passed. Independent of
    /// [`update_state`](Self::update_state).
    async fn sweep_neighbors(&self) -> Result<Vec<NeighborId>, ProtocolError>;

    async fn apply_configuration(&self, config: ProtocolConfig) -> Result<(), ProtocolError>;

    async fn stop(&self) -> Result<(), ProtocolError>;

    async fn dispose(&self) -> Result<(), ProtocolError>;

    fn lifecycle(&self) -> Lifecycle;

    fn state(&self) -> Result<StateSnapshot, ProtocolError>;

    fn typed_state_any(&self) -> Result<Box<dyn Any + Send>, ProtocolError>;

    fn configuration(&self) -> Result<ProtocolConfig, ProtocolError>;

    fn metrics(&self) -> Option<ProtocolMetrics>;

    /// Timer and event handler faults recorded since the last call. The
    /// scheduler drains these into its tick reports.
    fn take_faults(&self) -> Vec<Fault>;
}

impl dyn Protocol {
    /// The protocol-specific snapshot, if it is a `T`.
    pub fn typed_state<T: Any>(&self) -> Option<T> {
        self.typed_state_any()
            .ok()?
            .downcast::<T>()
            .ok()
            .map(|state| *state)
    }
}

pub type SharedProtocol = Arc<dyn Protocol>;

struct Inner<P: ProtocolBehavior> {
    behavior: P,
    config: P::Config,
    state: ProtocolState,
    metrics: ProtocolMetrics,
    lifecycle: Lifecycle,
    device: Option<SharedDevice>,
    hostname: String,
    running: bool,
    subscriber: Option<SubscriberId>,
    faults: Vec<Fault>,
}

impl<P: ProtocolBehavior> Inner<P> {
    fn push_faults(&mut self, faults: impl IntoIterator<Item = Fault>) {
        self.faults.extend(faults);
        let excess = self.faults.len().saturating_sub(MAX_PENDING_FAULTS);
        if excess > 0 {
            self.faults.drain(..excess);
        }
    }

    /// Runs `f` against the behavior with a hook context. Returns `None` if no
    /// device is bound.
    fn with_context<R>(
        &mut self,
        now: SimTime,
        f: impl FnOnce(&mut P, &P::Config, &mut HookContext<'_>) -> R,
    ) -> Option<(R, Vec<PendingEvent>)> {
        let device = self.device.clone()?;
        let protocol = self.behavior.protocol_type();
        let mut outbox = Vec::new();
        let mut ctx = HookContext {
            protocol,
            device: &device,
            now,
            state: &mut self.state,
            metrics: &mut self.metrics,
            outbox: &mut outbox,
        };
        let result = f(&mut self.behavior, &self.config, &mut ctx);
        Some((result, outbox))
    }

    fn check_usable(&self) -> Result<(), ProtocolError> {
        match self.lifecycle {
            Lifecycle::Disposed => Err(ProtocolError::Disposed),
            Lifecycle::Uninitialized => Err(ProtocolError::NotInitialized),
            _ => Ok(()),
        }
    }
}

/// Expires stale neighbors, calling the removal hook once per neighbor.
fn expire_neighbors<P: ProtocolBehavior>(
    behavior: &mut P,
    config: &P::Config,
    ctx: &mut HookContext<'_>,
) -> Vec<NeighborId> {
    let Some(hold_time) = behavior.hold_time(config) else {
        return Vec::new();
    };
    let expired = sweep_expired(ctx.state, ctx.now, hold_time);
    for neighbor in expired.iter() {
        let interface = behavior.on_neighbor_removed(neighbor, ctx);
        tracing::info!(
            device = %ctx.device.hostname(),
            protocol = %ctx.protocol,
            "Neighbor {} lost after {}s hold time",
            neighbor,
            hold_time.as_secs()
        );
        ctx.neighbor_event(neighbor, interface, NeighborChange::Lost);
    }
    expired
}

/// One tick of protocol work.
fn run_update<P: ProtocolBehavior>(
    behavior: &mut P,
    config: &P::Config,
    ctx: &mut HookContext<'_>,
) -> Result<(), HookError> {
    let discovered = behavior.update_neighbors(config, ctx);
    expire_neighbors(behavior, config, ctx);
    let result = discovered
        .and_then(|()| behavior.process_timers(config, ctx))
        .and_then(|()| {
            if ctx.state.is_changed() || behavior.topology_changed() {
                let started = std::time::Instant::now();
                behavior.run_protocol_calculation(config, ctx)?;
                ctx.metrics.record_calculation(started.elapsed());
                ctx.state.clear_changed();
            }
            Ok(())
        });
    if result.is_err() {
        ctx.metrics.error_count += 1;
    }
    result
}

/// Faults kept for [`Protocol::take_faults`] before the oldest are dropped.
const MAX_PENDING_FAULTS: usize = 256;

tokio::task_local! {
    /// The instance whose timer callback the current task is running.
    static TIMER_OWNER: usize;
}

struct Shared<P: ProtocolBehavior> {
    protocol: ProtocolType,
    bus: Arc<EventBus>,
    clock: SharedClock,
    inner: Mutex<Inner<P>>,
    timers: Mutex<TimerSet>,
    /// Held shared by every timer callback from `run_timer` until its events
    /// are published. `stop` takes it exclusively to wait those out.
    gate: tokio::sync::RwLock<()>,
}

impl<P: ProtocolBehavior> Shared<P> {
    fn lock(&self) -> MutexGuard<'_, Inner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timers(&self) -> MutexGuard<'_, TimerSet> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }

    fn start_timers(self: &Arc<Self>, specs: Vec<TimerSpec>) {
        let weak = Arc::downgrade(self);
        self.timers().start(specs, move |name| {
            let weak = weak.clone();
            async move {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                TIMER_OWNER
                    .scope(shared.address(), async {
                        let _pass = shared.gate.read().await;
                        let events = shared.run_timer(name);
                        shared.publish_queued(events).await;
                    })
                    .await;
            }
        });
    }

    /// Waits until no timer callback of this instance is mid-flight. Skipped
    /// when called from one of those callbacks, which would wait on itself.
    async fn quiesce_timers(&self) {
        let own_callback = TIMER_OWNER
            .try_with(|owner| *owner == self.address())
            .unwrap_or(false);
        if !own_callback {
            drop(self.gate.write().await);
        }
    }

    /// Publishes `events` and keeps any handler faults they cause.
    async fn publish_queued(&self, events: Vec<PendingEvent>) {
        if events.is_empty() {
            return;
        }
        let faults = self.bus.publish_all(events).await;
        self.record_faults(faults);
    }

    fn record_faults(&self, faults: Vec<Fault>) {
        if faults.is_empty() {
            return;
        }
        self.lock().push_faults(faults);
    }

    fn run_timer(&self, name: &'static str) -> Vec<PendingEvent> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        // A callback that was already in flight when the protocol stopped.
        if !inner.running || !inner.config.is_enabled() {
            return Vec::new();
        }
        let now = self.clock.now();
        let Some((outcome, events)) = inner.with_context(now, |behavior, config, ctx| {
            std::panic::catch_unwind(AssertUnwindSafe(|| behavior.on_timer(name, config, ctx)))
        }) else {
            return Vec::new();
        };
        let error = match outcome {
            Ok(Ok(())) => return events,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };
        inner.metrics.error_count += 1;
        tracing::error!(
            device = %inner.hostname,
            protocol = %self.protocol,
            timer = name,
            "Timer callback failed: {}",
            error
        );
        let fault = Fault {
            device: inner.device.as_ref().map(|device| device.id()),
            protocol: Some(self.protocol),
            origin: FaultOrigin::Timer,
            message: format!("{}: {}", name, error),
        };
        inner.push_faults([fault]);
        events
    }

    fn mark_changed(&self) {
        let mut inner = self.lock();
        if inner.running {
            inner.state.mark_changed();
        }
    }

    fn subscribe(self: &Arc<Self>, device: DeviceId, subscriber: SubscriberId) {
        let weak = Arc::downgrade(self);
        self.bus
            .subscribe(subscriber, move |event: Arc<InterfaceStateChanged>| {
                let weak = weak.clone();
                async move {
                    if event.device == device {
                        if let Some(shared) = weak.upgrade() {
                            shared.mark_changed();
                        }
                    }
                    Ok(())
                }
            });
        let weak = Arc::downgrade(self);
        self.bus
            .subscribe(subscriber, move |event: Arc<ProtocolConfigurationChanged>| {
                let weak = weak.clone();
                async move {
                    if event.device == device {
                        if let Some(shared) = weak.upgrade() {
                            shared.mark_changed();
                        }
                    }
                    Ok(())
                }
            });
    }

    /// Binds the device. Returns the subscriber to register (if not already
    /// registered), the timers to start, and queued events.
    fn begin_initialize(
        &self,
        device: SharedDevice,
    ) -> Result<Option<(Option<SubscriberId>, Vec<TimerSpec>, Vec<PendingEvent>)>, ProtocolError>
    {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.lifecycle {
            Lifecycle::Disposed => return Err(ProtocolError::Disposed),
            Lifecycle::Uninitialized | Lifecycle::Stopped => {}
            _ => return Ok(None),
        }

        if let Some(stored) = device.protocol_configuration(self.protocol) {
            let imported = inner
                .behavior
                .config_from(stored)
                .and_then(|config| config.validate().map(|()| config));
            match imported {
                Ok(config) => inner.config = config,
                Err(e) => tracing::warn!(
                    device = %device.hostname(),
                    protocol = %self.protocol,
                    "Ignoring stored configuration: {}",
                    e
                ),
            }
        }

        inner.state = inner.behavior.create_state();
        inner.hostname = device.hostname();
        inner.device = Some(device.clone());
        inner.running = true;
        inner.lifecycle = Lifecycle::Initialized;

        let now = self.clock.now();
        let events = inner
            .with_context(now, |behavior, config, ctx| behavior.on_initialize(config, ctx))
            .map(|((), events)| events)
            .unwrap_or_default();

        let subscriber = match inner.subscriber {
            Some(_) => None,
            None => {
                let subscriber = SubscriberId::for_protocol(device.id(), self.protocol);
                inner.subscriber = Some(subscriber);
                Some(subscriber)
            }
        };
        let timers = if inner.config.is_enabled() {
            inner.behavior.timers(&inner.config)
        } else {
            Vec::new()
        };
        tracing::debug!(
            device = %inner.hostname,
            protocol = %self.protocol,
            "Protocol initialized"
        );
        Ok(Some((subscriber, timers, events)))
    }

    fn update(&self) -> (Result<(), ProtocolError>, Vec<PendingEvent>) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Err(e) = inner.check_usable() {
            return (Err(e), Vec::new());
        }
        if inner.lifecycle == Lifecycle::Stopped {
            return (Ok(()), Vec::new());
        }
        if !inner.config.is_enabled() {
            inner.state.set_active(false);
            if inner.lifecycle != Lifecycle::Inactive {
                tracing::debug!(
                    device = %inner.hostname,
                    protocol = %self.protocol,
                    "Protocol disabled by configuration"
                );
                inner.lifecycle = Lifecycle::Inactive;
            }
            return (Ok(()), Vec::new());
        }
        inner.state.set_active(true);
        inner.lifecycle = Lifecycle::Active;

        let now = self.clock.now();
        match inner.with_context(now, run_update::<P>) {
            Some((result, events)) => (
                result.map_err(|e| ProtocolError::Hook {
                    protocol: self.protocol,
                    reason: e.to_string(),
                }),
                events,
            ),
            None => (Err(ProtocolError::NotInitialized), Vec::new()),
        }
    }

    fn sweep(&self) -> Result<(Vec<NeighborId>, Vec<PendingEvent>), ProtocolError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.check_usable()?;
        if !inner.running {
            return Ok((Vec::new(), Vec::new()));
        }
        let now = self.clock.now();
        Ok(inner
            .with_context(now, expire_neighbors::<P>)
            .unwrap_or_default())
    }

    /// Swaps in `config`. Returns the timers to restart with (if they need a
    /// restart), the bound device, and queued events.
    #[allow(clippy::type_complexity)]
    fn reconfigure(
        &self,
        config: ProtocolConfig,
    ) -> Result<(Option<Vec<TimerSpec>>, Option<SharedDevice>, Vec<PendingEvent>), ProtocolError>
    {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.lifecycle == Lifecycle::Disposed {
            return Err(ProtocolError::Disposed);
        }

        let validated = inner
            .behavior
            .config_from(config)
            .and_then(|config| config.validate().map(|()| config));
        let new = match validated {
            Ok(new) => new,
            Err(e) => {
                tracing::warn!(
                    device = %inner.hostname,
                    protocol = %self.protocol,
                    "Configuration rejected: {}",
                    e
                );
                return Err(e.into());
            }
        };

        let enabled = new.is_enabled();
        let restart = inner.behavior.requires_restart(&inner.config, &new)
            || inner.config.is_enabled() != enabled;
        let old = std::mem::replace(&mut inner.config, new);

        if matches!(inner.lifecycle, Lifecycle::Active | Lifecycle::Inactive) {
            inner.state.set_active(enabled);
            inner.lifecycle = if enabled {
                Lifecycle::Active
            } else {
                Lifecycle::Inactive
            };
        }
        inner.state.mark_changed();

        let now = self.clock.now();
        let events = inner
            .with_context(now, |behavior, config, ctx| {
                behavior.on_configuration_applied(&old, config, ctx)
            })
            .map(|((), events)| events)
            .unwrap_or_default();

        let timers = (restart && inner.running).then(|| {
            if enabled {
                inner.behavior.timers(&inner.config)
            } else {
                Vec::new()
            }
        });
        tracing::debug!(
            device = %inner.hostname,
            protocol = %self.protocol,
            restart_timers = timers.is_some(),
            "Configuration applied"
        );
        Ok((timers, inner.device.clone(), events))
    }

    /// Marks the instance stopped. Returns the subscriber to remove, if any,
    /// and queued events.
    fn halt(&self) -> Result<(Option<SubscriberId>, Vec<PendingEvent>), ProtocolError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.lifecycle {
            Lifecycle::Disposed => return Err(ProtocolError::Disposed),
            Lifecycle::Stopped => return Ok((None, Vec::new())),
            _ => {}
        }
        inner.running = false;
        let now = self.clock.now();
        let events = inner
            .with_context(now, |behavior, config, ctx| behavior.on_stop(config, ctx))
            .map(|((), events)| events)
            .unwrap_or_default();
        inner.state.set_active(false);
        inner.lifecycle = Lifecycle::Stopped;
        tracing::debug!(
            device = %inner.hostname,
            protocol = %self.protocol,
            "Protocol stopped"
        );
        Ok((inner.subscriber.take(), events))
    }
}

/// A [`ProtocolBehavior`] running inside the shared lifecycle.
pub struct ProtocolInstance<P: ProtocolBehavior> {
    shared: Arc<Shared<P>>,
}

impl<P: ProtocolBehavior> ProtocolInstance<P> {
    /// Creates an uninitialized instance with the behavior's default configuration.
    pub fn new(behavior: P, bus: Arc<EventBus>, clock: SharedClock) -> Self {
        let config = behavior.default_config();
        Self::build(behavior, config, bus, clock)
    }

    /// Creates an uninitialized instance with `config`, which must be valid.
    pub fn with_config(
        behavior: P,
        config: P::Config,
        bus: Arc<EventBus>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(behavior, config, bus, clock))
    }

    fn build(behavior: P, config: P::Config, bus: Arc<EventBus>, clock: SharedClock) -> Self {
        let protocol = behavior.protocol_type();
        let state = behavior.create_state();
        Self {
            shared: Arc::new(Shared {
                protocol,
                bus,
                clock,
                inner: Mutex::new(Inner {
                    behavior,
                    config,
                    state,
                    metrics: ProtocolMetrics::default(),
                    lifecycle: Lifecycle::Uninitialized,
                    device: None,
                    hostname: String::new(),
                    running: false,
                    subscriber: None,
                    faults: Vec::new(),
                }),
                timers: Mutex::new(TimerSet::default()),
                gate: tokio::sync::RwLock::new(()),
            }),
        }
    }

    pub fn shared(self) -> SharedProtocol {
        Arc::new(self)
    }

    /// Runs `f` against the behavior, under the instance lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&self.shared.lock().behavior)
    }

    /// The current typed configuration.
    pub fn config(&self) -> P::Config {
        self.shared.lock().config.clone()
    }

    /// The background timers currently scheduled.
    pub fn active_timers(&self) -> Vec<TimerSpec> {
        self.shared.timers().specs().to_vec()
    }
}

#[async_trait::async_trait]
impl<P: ProtocolBehavior> Protocol for ProtocolInstance<P> {
    fn protocol_type(&self) -> ProtocolType {
        self.shared.protocol
    }

    fn device_id(&self) -> Option<DeviceId> {
        self.shared.lock().device.as_ref().map(|device| device.id())
    }

    async fn initialize(&self, device: SharedDevice) -> Result<(), ProtocolError> {
        let device_id = device.id();
        let Some((subscriber, timers, events)) = self.shared.begin_initialize(device)? else {
            return Ok(());
        };
        if let Some(subscriber) = subscriber {
            self.shared.subscribe(device_id, subscriber);
        }
        self.shared.start_timers(timers);
        self.shared.publish_queued(events).await;
        Ok(())
    }

    async fn update_state(&self) -> Result<(), ProtocolError> {
        let (result, events) = self.shared.update();
        self.shared.publish_queued(events).await;
        result
    }

    async fn sweep_neighbors(&self) -> Result<Vec<NeighborId>, ProtocolError> {
        let (expired, events) = self.shared.sweep()?;
        self.shared.publish_queued(events).await;
        Ok(expired)
    }

    async fn apply_configuration(&self, config: ProtocolConfig) -> Result<(), ProtocolError> {
        let stored = config.clone();
        let (timers, device, events) = self.shared.reconfigure(config)?;
        if let Some(timers) = timers {
            self.shared.start_timers(timers);
        }
        if let Some(device) = device {
            device.set_protocol_configuration(stored);
            let report = self
                .shared
                .bus
                .publish(ProtocolConfigurationChanged {
                    device: device.id(),
                    protocol: self.shared.protocol,
                    timestamp: self.shared.clock.now(),
                })
                .await;
            self.shared.record_faults(report.faults);
        }
        self.shared.publish_queued(events).await;
        Ok(())
    }

    /// Once this returns, no timer callback of the instance publishes again.
    async fn stop(&self) -> Result<(), ProtocolError> {
        let (subscriber, events) = self.shared.halt()?;
        self.shared.timers().cancel();
        self.shared.quiesce_timers().await;
        if let Some(subscriber) = subscriber {
            self.shared.bus.unsubscribe_all(subscriber);
        }
        self.shared.publish_queued(events).await;
        Ok(())
    }

    async fn dispose(&self) -> Result<(), ProtocolError> {
        self.stop().await?;
        let mut inner = self.shared.lock();
        inner.lifecycle = Lifecycle::Disposed;
        inner.device = None;
        Ok(())
    }

    fn lifecycle(&self) -> Lifecycle {
        self.shared.lock().lifecycle
    }

    fn state(&self) -> Result<StateSnapshot, ProtocolError> {
        let inner = self.shared.lock();
        match inner.lifecycle {
            Lifecycle::Disposed => Err(ProtocolError::Disposed),
            _ => Ok(inner.state.snapshot()),
        }
    }

    fn typed_state_any(&self) -> Result<Box<dyn Any + Send>, ProtocolError> {
        let inner = self.shared.lock();
        match inner.lifecycle {
            Lifecycle::Disposed => Err(ProtocolError::Disposed),
            _ => Ok(inner.behavior.snapshot(self.shared.clock.now())),
        }
    }

    fn configuration(&self) -> Result<ProtocolConfig, ProtocolError> {
        let inner = self.shared.lock();
        match inner.lifecycle {
            Lifecycle::Disposed => Err(ProtocolError::Disposed),
            _ => Ok(inner.behavior.config_into(&inner.config)),
        }
    }

    fn metrics(&self) -> Option<ProtocolMetrics> {
        let inner = self.shared.lock();
        match inner.lifecycle {
            Lifecycle::Disposed => None,
            _ => Some(inner.metrics.clone()),
        }
    }

    fn take_faults(&self) -> Vec<Fault> {
        std::mem::take(&mut self.shared.lock().faults)
    }
}
