//! Multi-node scenarios over loopback connectors.
//!
//! ```text
//!            phone (core client)
//!              │
//!   watch ── hub (reference) ── sensor (dependent client)
//! ```

use ecology_core::{
    DataSyncListener, Ecology, EcologyConfig, EcologyFactory, EcologyHandle, EcologyRuntime,
    EventReceiver,
};
use ecology_protocol::{DeviceId, Value};
use ecology_transport::{ConnectorRole, LoopbackConnector};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

type Changes = Arc<Mutex<Vec<(String, Option<Value>, Option<Value>)>>>;
type Events = Arc<Mutex<Vec<Vec<Value>>>>;

struct Node {
    handle: EcologyHandle,
    join: JoinHandle<Ecology>,
    changes: Changes,
}

fn ecology(device: &str, is_reference: bool) -> Ecology {
    EcologyFactory::new()
        .create(EcologyConfig {
            device_id: DeviceId::new(device),
            is_reference,
        })
        .unwrap()
}

fn record_changes(ecology: &mut Ecology) -> Changes {
    let changes: Changes = Arc::default();
    let sink = Arc::clone(&changes);
    let listener: Arc<dyn DataSyncListener> =
        Arc::new(move |key: &str, new: Option<&Value>, old: Option<&Value>| {
            sink.lock()
                .unwrap()
                .push((key.to_string(), new.cloned(), old.cloned()));
        });
    ecology.data_sync_mut().add_listener(listener);
    changes
}

async fn start(mut ecology: Ecology) -> Node {
    let changes = record_changes(&mut ecology);
    ecology.connect_all().await.unwrap();
    let (handle, join) = EcologyRuntime::spawn(ecology);
    Node {
        handle,
        join,
        changes,
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

async fn subscribe(node: &Node, room: &'static str, event: &'static str) -> Events {
    let events: Events = Arc::default();
    let sink = Arc::clone(&events);
    let receiver: Arc<dyn EventReceiver> = Arc::new(move |_: &str, data: &[Value]| {
        sink.lock().unwrap().push(data.to_vec());
    });
    node.handle
        .request(move |ecology| {
            ecology
                .room(room)
                .unwrap()
                .event_broadcaster_mut()
                .subscribe(event, receiver)
                .unwrap();
        })
        .await
        .unwrap();
    events
}

/// Hub seeded with `{a: 1, b: 2}`, two core clients and one dependent.
async fn mesh() -> (Node, Node, Node, Node) {
    let mut hub = ecology("hub", true);
    let mut phone = ecology("phone", false);
    let mut watch = ecology("watch", false);
    let mut sensor = ecology("sensor", false);

    let (hub_phone, phone_hub) =
        LoopbackConnector::pair(ConnectorRole::CoreServer, ConnectorRole::CoreClient);
    let (hub_watch, watch_hub) =
        LoopbackConnector::pair(ConnectorRole::CoreServer, ConnectorRole::CoreClient);
    let (hub_sensor, sensor_hub) =
        LoopbackConnector::pair(ConnectorRole::DependentServer, ConnectorRole::DependentClient);

    hub.add_connector(Box::new(hub_phone));
    hub.add_connector(Box::new(hub_watch));
    hub.add_connector(Box::new(hub_sensor));
    phone.add_connector(Box::new(phone_hub));
    watch.add_connector(Box::new(watch_hub));
    sensor.add_connector(Box::new(sensor_hub));

    hub.set_data("a", 1);
    hub.set_data("b", 2);

    let hub = start(hub).await;
    let phone = start(phone).await;
    let watch = start(watch).await;
    let sensor = start(sensor).await;
    (hub, phone, watch, sensor)
}

async fn stop(nodes: Vec<Node>) {
    for node in &nodes {
        node.handle.shutdown();
    }
    for node in nodes {
        node.join.await.unwrap();
    }
}

#[tokio::test]
async fn test_replicas_converge_on_reference_data() {
    let (hub, phone, watch, sensor) = mesh().await;

    for replica in [&phone, &watch, &sensor] {
        eventually("initial sync", || replica.handle.is_synchronized()).await;
        assert_eq!(replica.handle.get_data("a"), Some(Value::from(1)));
        assert_eq!(replica.handle.get_data("b"), Some(Value::from(2)));
        assert_eq!(replica.handle.data().keys(), vec!["a", "b"]);
    }
    assert!(hub.handle.is_synchronized());
    assert!(hub.handle.is_connected().await.unwrap());

    stop(vec![hub, phone, watch, sensor]).await;
}

#[tokio::test]
async fn test_deletion_propagates() {
    let (hub, phone, watch, sensor) = mesh().await;
    eventually("initial sync", || {
        phone.handle.is_synchronized() && watch.handle.is_synchronized()
    })
    .await;

    phone.handle.set_data("b", Value::Null).unwrap();

    let deleted = ("b".to_string(), None, Some(Value::from(2)));
    for node in [&hub, &watch, &sensor] {
        eventually("deletion", || node.handle.get_data("b").is_none()).await;
        eventually("deletion notification", || {
            node.changes.lock().unwrap().last() == Some(&deleted)
        })
        .await;
    }
    assert_eq!(phone.changes.lock().unwrap().last(), Some(&deleted));

    stop(vec![hub, phone, watch, sensor]).await;
}

#[tokio::test]
async fn test_writes_from_replicas_reach_everyone() {
    let (hub, phone, watch, sensor) = mesh().await;
    eventually("initial sync", || sensor.handle.is_synchronized()).await;

    sensor.handle.set_data("temperature", 21.5f64).unwrap();

    for node in [&hub, &phone, &watch] {
        eventually("replicated write", || {
            node.handle.get_data("temperature") == Some(Value::from(21.5f64))
        })
        .await;
    }

    stop(vec![hub, phone, watch, sensor]).await;
}

#[tokio::test]
async fn test_events_cross_the_mesh() {
    let (hub, phone, watch, sensor) = mesh().await;
    let watch_taps = subscribe(&watch, "lobby", "tap").await;
    let phone_taps = subscribe(&phone, "lobby", "tap").await;
    let watch_swipes = subscribe(&watch, "lobby", "swipe").await;

    phone
        .handle
        .publish("lobby", "tap", vec![Value::from(1), Value::from("x")])
        .unwrap();
    eventually("tap on watch", || !watch_taps.lock().unwrap().is_empty()).await;
    assert_eq!(
        watch_taps.lock().unwrap()[0],
        vec![Value::from(1), Value::from("x")]
    );

    // dependent to core, through the hub
    sensor.handle.publish("lobby", "tap", vec![Value::from(2)]).unwrap();
    eventually("sensor tap on phone", || phone_taps.lock().unwrap().len() == 2).await;
    eventually("sensor tap on watch", || watch_taps.lock().unwrap().len() == 2).await;

    // the publisher saw its own tap exactly once
    assert_eq!(phone_taps.lock().unwrap()[0], vec![Value::from(1), Value::from("x")]);
    assert!(watch_swipes.lock().unwrap().is_empty());

    stop(vec![hub, phone, watch, sensor]).await;
}

/// The reference is a core client of a hub that is only a replica.
///
/// ```text
///   ref (reference, core client) ── hub (core server) ── watch (core client)
/// ```
#[tokio::test]
async fn test_reference_behind_a_replica_hub() {
    let mut hub = ecology("hub", false);
    let mut reference = ecology("ref", true);
    let mut watch = ecology("watch", false);

    let (hub_ref, ref_hub) =
        LoopbackConnector::pair(ConnectorRole::CoreServer, ConnectorRole::CoreClient);
    let (hub_watch, watch_hub) =
        LoopbackConnector::pair(ConnectorRole::CoreServer, ConnectorRole::CoreClient);
    hub.add_connector(Box::new(hub_ref));
    hub.add_connector(Box::new(hub_watch));
    reference.add_connector(Box::new(ref_hub));
    watch.add_connector(Box::new(watch_hub));

    reference.set_data("a", 1);
    reference.set_data("b", 2);

    let hub = start(hub).await;
    let reference = start(reference).await;
    let watch = start(watch).await;

    for replica in [&hub, &watch] {
        eventually("initial sync", || replica.handle.is_synchronized()).await;
        assert_eq!(replica.handle.get_data("a"), Some(Value::from(1)));
        assert_eq!(replica.handle.get_data("b"), Some(Value::from(2)));
    }

    stop(vec![hub, reference, watch]).await;
}

/// A dependent two hops away from the reference.
///
/// ```text
///   ref (reference, core server) ── hub ── sensor (dependent client)
/// ```
#[tokio::test]
async fn test_replica_two_hops_from_reference() {
    let mut reference = ecology("ref", true);
    let mut hub = ecology("hub", false);
    let mut sensor = ecology("sensor", false);

    let (ref_hub, hub_ref) =
        LoopbackConnector::pair(ConnectorRole::CoreServer, ConnectorRole::CoreClient);
    let (hub_sensor, sensor_hub) =
        LoopbackConnector::pair(ConnectorRole::DependentServer, ConnectorRole::DependentClient);
    reference.add_connector(Box::new(ref_hub));
    hub.add_connector(Box::new(hub_ref));
    hub.add_connector(Box::new(hub_sensor));
    sensor.add_connector(Box::new(sensor_hub));

    reference.set_data("a", 1);
    reference.set_data("b", 2);

    let reference = start(reference).await;
    let hub = start(hub).await;
    let sensor = start(sensor).await;

    eventually("sensor sync", || sensor.handle.is_synchronized()).await;
    assert_eq!(sensor.handle.data().keys(), vec!["a", "b"]);
    assert_eq!(
        sensor.changes.lock().unwrap().iter().filter(|c| c.0 == "a").count(),
        1
    );

    // later writes take the same path
    sensor.handle.set_data("c", Value::from(3)).unwrap();
    eventually("write reaches reference", || {
        reference.handle.get_data("c") == Some(Value::from(3))
    })
    .await;

    stop(vec![reference, hub, sensor]).await;
}
