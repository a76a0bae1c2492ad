//! A typed publish/subscribe hub.
//!
//! Protocols and the topology layer communicate exclusively through the bus.
//! Handlers are registered per event type under a [`SubscriberId`] and are
//! awaited one after another, in registration order, whenever an event of
//! that type is published. A failing or panicking handler is logged and
//! counted, and delivery continues with the next handler.
//!
//! ```
//! use netplane_core::{event::InterfaceStateChanged, DeviceId, EventBus, SimTime, SubscriberId};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = EventBus::new();
//! bus.subscribe(SubscriberId::from_string("monitor"), |event: std::sync::Arc<InterfaceStateChanged>| async move {
//!     println!("{} is now {}", event.interface, if event.up { "up" } else { "down" });
//!     Ok(())
//! });
//! let report = bus
//!     .publish(InterfaceStateChanged {
//!         device: DeviceId::new(1),
//!         interface: "Gi0/0".into(),
//!         up: false,
//!         timestamp: SimTime::ZERO,
//!     })
//!     .await;
//! assert_eq!(report.delivered, 1);
//! # }
//! ```

use crate::{
    event::Event,
    fault::{panic_message, Fault, FaultOrigin},
    id::{DeviceId, SubscriberId},
    protocol_type::ProtocolType,
    FxDashMap,
};
use futures::{future::BoxFuture, FutureExt};
use std::{
    any::{Any, TypeId},
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type ErasedEvent = Arc<dyn Any + Send + Sync>;
type ErasedHandler = Arc<dyn Fn(ErasedEvent) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    subscriber: SubscriberId,
    handler: ErasedHandler,
}

/// An event waiting to be published. Protocols collect these while holding
/// their own lock and publish them once the lock is released.
#[derive(Clone)]
pub struct PendingEvent {
    type_id: TypeId,
    type_name: &'static str,
    device: Option<DeviceId>,
    protocol: Option<ProtocolType>,
    event: ErasedEvent,
}

impl PendingEvent {
    pub fn new<E: Event>(event: E) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            device: event.device(),
            protocol: event.protocol(),
            event: Arc::new(event),
        }
    }

    /// Gets the event back if it is of type `E`.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.event.downcast_ref::<E>()
    }
}

impl std::fmt::Debug for PendingEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEvent")
            .field("type", &self.type_name)
            .finish()
    }
}

/// The outcome of one publication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Handlers that completed successfully.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
    /// One [`FaultOrigin::Handler`] fault per failed handler, attributed to
    /// the device and protocol the event concerns.
    pub faults: Vec<Fault>,
}

#[derive(Default)]
pub struct EventBus {
    handlers: FxDashMap<TypeId, Vec<Registration>>,
    faults: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Registers `handler` for events of type `E`. A subscriber may register
    /// any number of handlers; they run in the order they were registered.
    pub fn subscribe<E, F, Fut>(&self, subscriber: SubscriberId, handler: F)
    where
        E: Event,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |event: ErasedEvent| {
            let handler = handler.clone();
            async move {
                match event.downcast::<E>() {
                    Ok(event) => handler(event).await,
                    Err(_) => Ok(()),
                }
            }
            .boxed()
        });
        self.handlers
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Registration {
                subscriber,
                handler: erased,
            });
    }

    /// Removes every handler `subscriber` registered for events of type `E`.
    /// Returns whether anything was removed.
    pub fn unsubscribe<E: Event>(&self, subscriber: SubscriberId) -> bool {
        self.unsubscribe_type(TypeId::of::<E>(), subscriber)
    }

    /// Removes every handler `subscriber` registered, for all event types.
    pub fn unsubscribe_all(&self, subscriber: SubscriberId) -> usize {
        let mut removed = 0;
        for mut entry in self.handlers.iter_mut() {
            let before = entry.len();
            entry.retain(|registration| registration.subscriber != subscriber);
            removed += before - entry.len();
        }
        self.handlers.retain(|_, registrations| !registrations.is_empty());
        removed
    }

    fn unsubscribe_type(&self, type_id: TypeId, subscriber: SubscriberId) -> bool {
        let removed = match self.handlers.get_mut(&type_id) {
            Some(mut registrations) => {
                let before = registrations.len();
                registrations.retain(|registration| registration.subscriber != subscriber);
                before != registrations.len()
            }
            None => false,
        };
        self.handlers
            .remove_if(&type_id, |_, registrations| registrations.is_empty());
        removed
    }

    /// The number of handlers registered for events of type `E`.
    pub fn handler_count<E: Event>(&self) -> usize {
        self.handlers
            .get(&TypeId::of::<E>())
            .map(|registrations| registrations.len())
            .unwrap_or(0)
    }

    /// The number of handler failures recorded since the bus was created.
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Delivers `event` to every handler registered for its type.
    pub async fn publish<E: Event>(&self, event: E) -> DeliveryReport {
        self.publish_pending(PendingEvent::new(event)).await
    }

    pub async fn publish_pending(&self, pending: PendingEvent) -> DeliveryReport {
        // Snapshot the handler list so no map guard is held while handlers
        // run. Handlers may subscribe, unsubscribe, or publish.
        let registrations: Vec<Registration> = match self.handlers.get(&pending.type_id) {
            Some(registrations) => registrations.clone(),
            None => return DeliveryReport::default(),
        };

        let mut report = DeliveryReport::default();
        for registration in registrations {
            let outcome = AssertUnwindSafe((registration.handler)(pending.event.clone()))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            report.failed += 1;
            self.faults.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                event = pending.type_name,
                subscriber = %registration.subscriber,
                "Event handler failed: {}",
                error
            );
            report.faults.push(Fault {
                device: pending.device,
                protocol: pending.protocol,
                origin: FaultOrigin::Handler,
                message: format!(
                    "{} handling {}: {}",
                    registration.subscriber, pending.type_name, error
                ),
            });
        }
        report
    }

    /// Publishes a batch in order and returns the handler faults it caused.
    pub async fn publish_all(&self, events: impl IntoIterator<Item = PendingEvent>) -> Vec<Fault> {
        let mut faults = Vec::new();
        for event in events {
            faults.extend(self.publish_pending(event).await.faults);
        }
        faults
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::InterfaceStateChanged, id::DeviceId, time::SimTime};
    use std::sync::Mutex;

    fn interface_down() -> InterfaceStateChanged {
        InterfaceStateChanged {
            device: DeviceId::new(7),
            interface: "Gi0/1".into(),
            up: false,
            timestamp: SimTime::ZERO,
        }
    }

    #[tokio::test]
    async fn unsubscribe_is_targeted() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let calls = calls.clone();
            bus.subscribe(
                SubscriberId::from_name(name),
                move |_: Arc<InterfaceStateChanged>| {
                    let calls = calls.clone();
                    async move {
                        calls.lock().unwrap().push(name);
                        Ok(())
                    }
                },
            );
        }

        assert!(bus.unsubscribe::<InterfaceStateChanged>(SubscriberId::from_name("a")));
        assert!(!bus.unsubscribe::<InterfaceStateChanged>(SubscriberId::from_name("a")));
        bus.publish(interface_down()).await;
        assert_eq!(*calls.lock().unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn publish_without_handlers_is_a_no_op() {
        let bus = EventBus::new();
        let report = bus.publish(interface_down()).await;
        assert_eq!(report, DeliveryReport::default());
    }

    #[tokio::test]
    async fn handlers_may_subscribe_while_being_dispatched() {
        let bus = Arc::new(EventBus::new());
        let inner_bus = bus.clone();
        bus.subscribe(
            SubscriberId::from_string("outer"),
            move |_: Arc<InterfaceStateChanged>| {
                let bus = inner_bus.clone();
                async move {
                    bus.subscribe(
                        SubscriberId::from_string("late"),
                        |_: Arc<InterfaceStateChanged>| async { Ok(()) },
                    );
                    Ok(())
                }
            },
        );
        let report = bus.publish(interface_down()).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(bus.handler_count::<InterfaceStateChanged>(), 2);
    }

    #[tokio::test]
    async fn failed_handlers_become_handler_faults() {
        let bus = EventBus::new();
        bus.subscribe(
            SubscriberId::from_string("fine"),
            |_: Arc<InterfaceStateChanged>| async { Ok(()) },
        );
        bus.subscribe(
            SubscriberId::from_string("broken"),
            |_: Arc<InterfaceStateChanged>| async {
                let result: HandlerResult = Err("no route".into());
                result
            },
        );

        let faults = bus
            .publish_all([
                PendingEvent::new(interface_down()),
                PendingEvent::new(interface_down()),
            ])
            .await;
        assert_eq!(faults.len(), 2);
        for fault in faults {
            assert_eq!(fault.origin, FaultOrigin::Handler);
            assert_eq!(fault.device, Some(DeviceId::new(7)));
            assert_eq!(fault.protocol, None);
            assert!(fault.message.contains("no route"), "{}", fault);
        }
        assert_eq!(bus.fault_count(), 2);
    }
}
