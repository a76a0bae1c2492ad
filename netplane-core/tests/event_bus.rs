use netplane_core::{
    event::{InterfaceStateChanged, PacketDirection, PacketEvent},
    event_bus::HandlerResult,
    DeviceId, EventBus, ProtocolType, SimTime, SubscriberId,
};
use std::sync::{Arc, Mutex};

fn interface_down() -> InterfaceStateChanged {
    InterfaceStateChanged {
        device: DeviceId::new(1),
        interface: "Gi0/0".into(),
        up: false,
        timestamp: SimTime::from_secs(5),
    }
}

#[tokio::test]
async fn failing_handler_does_not_stop_the_others() {
    let bus = EventBus::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    for (name, fails) in [("first", false), ("second", true), ("third", false)] {
        let calls = calls.clone();
        bus.subscribe(
            SubscriberId::from_name(name),
            move |event: Arc<InterfaceStateChanged>| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push((name, event.interface.clone()));
                    let result: HandlerResult = if fails {
                        Err("handler refused".into())
                    } else {
                        Ok(())
                    };
                    result
                }
            },
        );
    }

    let report = bus.publish(interface_down()).await;
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(bus.fault_count(), 1);
    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            ("first", "Gi0/0".to_string()),
            ("second", "Gi0/0".to_string()),
            ("third", "Gi0/0".to_string()),
        ]
    );
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let bus = EventBus::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let first = calls.clone();
    bus.subscribe(
        SubscriberId::from_string("first"),
        move |_: Arc<InterfaceStateChanged>| {
            let calls = first.clone();
            async move {
                calls.lock().unwrap().push(1);
                Ok(())
            }
        },
    );
    bus.subscribe(
        SubscriberId::from_string("second"),
        |_: Arc<InterfaceStateChanged>| async move {
            panic!("handler bug")
        },
    );
    let third = calls.clone();
    bus.subscribe(
        SubscriberId::from_string("third"),
        move |_: Arc<InterfaceStateChanged>| {
            let calls = third.clone();
            async move {
                calls.lock().unwrap().push(3);
                Ok(())
            }
        },
    );

    let report = bus.publish(interface_down()).await;
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(*calls.lock().unwrap(), vec![1, 3]);

    // The bus keeps working afterwards.
    let report = bus.publish(interface_down()).await;
    assert_eq!(report.delivered, 2);
    assert_eq!(bus.fault_count(), 2);
}

#[tokio::test]
async fn handlers_only_see_their_event_type() {
    let bus = EventBus::new();
    let packets = Arc::new(Mutex::new(0));
    let counter = packets.clone();
    bus.subscribe(
        SubscriberId::from_string("packets"),
        move |_: Arc<PacketEvent>| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        },
    );

    let report = bus.publish(interface_down()).await;
    assert_eq!(report.delivered, 0);
    bus.publish(PacketEvent {
        device: DeviceId::new(1),
        protocol: ProtocolType::Cdp,
        interface: "Gi0/0".into(),
        direction: PacketDirection::Sent,
        kind: "advertisement",
        timestamp: SimTime::ZERO,
    })
    .await;
    assert_eq!(*packets.lock().unwrap(), 1);
}

#[tokio::test]
async fn unsubscribe_all_drops_every_handler_of_a_subscriber() {
    let bus = EventBus::new();
    let subscriber = SubscriberId::from_string("protocol");
    bus.subscribe(subscriber, |_: Arc<InterfaceStateChanged>| async { Ok(()) });
    bus.subscribe(subscriber, |_: Arc<PacketEvent>| async { Ok(()) });
    bus.subscribe(
        SubscriberId::from_string("monitor"),
        |_: Arc<PacketEvent>| async { Ok(()) },
    );

    assert_eq!(bus.unsubscribe_all(subscriber), 2);
    assert_eq!(bus.handler_count::<InterfaceStateChanged>(), 0);
    assert_eq!(bus.handler_count::<PacketEvent>(), 1);
    assert_eq!(bus.unsubscribe_all(subscriber), 0);
}

#[tokio::test]
async fn handler_may_publish_while_being_dispatched() {
    let bus = Arc::new(EventBus::new());
    let relay = bus.clone();
    bus.subscribe(
        SubscriberId::from_string("relay"),
        move |event: Arc<InterfaceStateChanged>| {
            let bus = relay.clone();
            async move {
                bus.publish(PacketEvent {
                    device: event.device,
                    protocol: ProtocolType::Lldp,
                    interface: event.interface.clone(),
                    direction: PacketDirection::Dropped,
                    kind: "advertisement",
                    timestamp: event.timestamp,
                })
                .await;
                Ok(())
            }
        },
    );
    let dropped = Arc::new(Mutex::new(Vec::new()));
    let sink = dropped.clone();
    bus.subscribe(
        SubscriberId::from_string("sink"),
        move |event: Arc<PacketEvent>| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event.direction);
                Ok(())
            }
        },
    );

    bus.publish(interface_down()).await;
    assert_eq!(*dropped.lock().unwrap(), vec![PacketDirection::Dropped]);
}
