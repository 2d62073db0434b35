use clustermount::channel::wire::NotificationFrame;
use clustermount::net::TcpTransport;
use clustermount::session::schema::SchemaSourceCache;
use clustermount::{
    ClusterNode, Credentials, DataPath, Datastore, DeviceConfig, DeviceId, Frame,
    InMemoryStatusStore, KeystoreCredentialStore, LocalOwnershipService, NodeDependencies,
    Notification, SimulatedConnector, SimulatedDevice, Transport,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn device_id() -> DeviceId {
    DeviceId::new("edge-1", "192.0.2.10", 830)
}

fn notification(seq: u64) -> Frame {
    Frame::Notification(NotificationFrame {
        device: device_id(),
        notification: Notification {
            stream: "seq".into(),
            event_time_ms: seq,
            body: json!({ "seq": seq }),
        },
    })
}

async fn recv(inbox: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("frame within deadline")
        .expect("inbox open")
}

fn loopback() -> std::net::SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn frames_flow_both_ways_in_order() {
    let (a, mut inbox_a, mut handle_a) = TcpTransport::bind(loopback()).await.unwrap();
    let (b, mut inbox_b, mut handle_b) = TcpTransport::bind(loopback()).await.unwrap();
    assert_eq!(a.local_address(), handle_a.local_addr().to_string());

    for seq in 0..50 {
        a.send(b.local_address(), notification(seq)).unwrap();
    }
    for seq in 0..50 {
        assert_eq!(recv(&mut inbox_b).await, notification(seq));
    }
    b.send(a.local_address(), notification(99)).unwrap();
    assert_eq!(recv(&mut inbox_a).await, notification(99));

    handle_a.shutdown().await;
    handle_b.shutdown().await;
}

#[tokio::test]
async fn sending_to_self_skips_the_socket() {
    let (a, mut inbox, mut handle) = TcpTransport::bind(loopback()).await.unwrap();
    a.send(a.local_address(), notification(1)).unwrap();
    assert_eq!(recv(&mut inbox).await, notification(1));
    handle.shutdown().await;
    handle.shutdown().await;
}

#[tokio::test]
async fn frames_to_a_stopped_listener_are_lost() {
    let (a, _inbox_a, mut handle_a) = TcpTransport::bind(loopback()).await.unwrap();
    let (b, mut inbox_b, mut handle_b) = TcpTransport::bind(loopback()).await.unwrap();
    let target = b.local_address().to_string();
    handle_b.shutdown().await;

    // Queuing succeeds; delivery is at most once.
    let _ = a.send(&target, notification(1));
    assert!(
        tokio::time::timeout(Duration::from_millis(200), inbox_b.recv())
            .await
            .map(|frame| frame.is_none())
            .unwrap_or(true)
    );
    handle_a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follower_mount_works_across_tcp() {
    let status = Arc::new(InMemoryStatusStore::new());
    let ownership = Arc::new(LocalOwnershipService::new());
    let connector = SimulatedConnector::new();
    let device = SimulatedDevice::new(device_id());
    connector.add(device.clone());
    let dependencies = || NodeDependencies {
        status: status.clone(),
        ownership: ownership.clone(),
        connector: connector.clone(),
        credentials: Arc::new(KeystoreCredentialStore::without_master_key()),
        schema_cache: SchemaSourceCache::in_memory(),
    };

    let mut handles = Vec::new();
    let mut nodes = Vec::new();
    for _ in 0..2 {
        let (transport, inbox, handle) = TcpTransport::bind(loopback()).await.unwrap();
        handles.push(handle);
        nodes.push(ClusterNode::start(transport, inbox, dependencies()));
    }

    let mut config = DeviceConfig::new(
        "edge-1",
        "192.0.2.10",
        830,
        Credentials::LoginPassword {
            username: "admin".into(),
            password: "admin".into(),
        },
    );
    config.ask_timeout_ms = 1_000;
    let id = config.id();
    for node in &nodes {
        node.mount_device(config.clone()).await.unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    let follower = loop {
        let mounted = nodes.iter().all(|node| node.mount_point(&id).is_some());
        let follower = nodes.iter().find(|node| {
            node.mount_point(&id)
                .map(|mount| !mount.is_owner())
                .unwrap_or(false)
        });
        match follower {
            Some(follower) if mounted => break Arc::clone(follower),
            _ => {
                assert!(Instant::now() < deadline, "cluster never settled");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    };

    let mount = follower.mount_point(&id).unwrap();
    let tx = mount.new_write_transaction().unwrap();
    tx.put(
        Datastore::Configuration,
        DataPath::parse("/system/hostname"),
        json!("over-tcp"),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        mount
            .read(Datastore::Configuration, &DataPath::parse("/system/hostname"))
            .await
            .unwrap(),
        Some(json!("over-tcp"))
    );
    assert_eq!(
        device.read(Datastore::Configuration, &DataPath::parse("/system/hostname")),
        Some(json!("over-tcp"))
    );

    for node in &nodes {
        node.shutdown().await;
    }
    for handle in &mut handles {
        handle.shutdown().await;
    }
}
