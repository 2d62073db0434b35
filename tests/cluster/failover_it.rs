#[path = "../support/cluster.rs"]
mod cluster;

use cluster::{eventually, TestCluster, SETTLE};
use clustermount::{
    DataPath, Datastore, DeviceId, MountError, MountPoint, OwnershipService, Role, StatusStore,
};
use serde_json::json;
use std::sync::Arc;

fn path(raw: &str) -> DataPath {
    DataPath::parse(raw)
}

/// Waits until `address` holds a live mount other than `previous`.
async fn remounted(cluster: &TestCluster, address: &str, id: &DeviceId, previous: &Arc<MountPoint>) {
    eventually(SETTLE, "follower mount rebuilt", || {
        cluster
            .node(address)
            .mount_point(id)
            .map(|mount| !Arc::ptr_eq(&mount, previous) && !mount.is_closed())
            .unwrap_or(false)
    })
    .await;
    assert!(previous.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follower_writes_survive_owner_crash() {
    let mut cluster = TestCluster::with_nodes(&["node-a", "node-b", "node-c"]);
    let (device, config) = cluster.add_device("edge-1");
    let id = config.id();
    cluster.mount_everywhere(&config).await;
    let owner = cluster.settle(&id).await;
    let (_, first_epoch) = cluster.ownership.owner_of(&id).unwrap();

    let follower = cluster.followers(&id)[0].clone();
    let mount = cluster.mount(follower.address(), &id);
    let tx = mount.new_write_transaction().unwrap();
    tx.put(
        Datastore::Configuration,
        path("/system/hostname"),
        json!("edge-1.lab"),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        device.read(Datastore::Configuration, &path("/system/hostname")),
        Some(json!("edge-1.lab"))
    );
    for node in &cluster.nodes {
        let value = cluster
            .mount(node.address(), &id)
            .read(Datastore::Configuration, &path("/system/hostname"))
            .await
            .unwrap();
        assert_eq!(value, Some(json!("edge-1.lab")), "read via {}", node.address());
    }

    let before: Vec<_> = cluster
        .followers(&id)
        .iter()
        .map(|node| (node.address().to_string(), cluster.mount(node.address(), &id)))
        .collect();
    let crashed = owner.address().to_string();
    cluster.crash(&crashed).await;
    eventually(SETTLE, "successor connected", || {
        cluster
            .status
            .get(&id)
            .map(|record| {
                record.connected
                    && record.owner_address.as_deref() != Some(crashed.as_str())
                    && record.owner_epoch > first_epoch
            })
            .unwrap_or(false)
    })
    .await;
    let successor = cluster.settle(&id).await;
    assert_ne!(successor.address(), crashed);
    assert!(matches!(
        successor.role(&id).await,
        Some(Role::Owner { epoch }) if epoch > first_epoch
    ));

    let (address, previous) = before
        .iter()
        .find(|(address, _)| address != successor.address())
        .unwrap();
    remounted(&cluster, address, &id, previous).await;
    let mount = cluster.mount(address, &id);
    assert_eq!(
        mount
            .read(Datastore::Configuration, &path("/system/hostname"))
            .await
            .unwrap(),
        Some(json!("edge-1.lab"))
    );
    let tx = mount.new_write_transaction().unwrap();
    tx.merge(
        Datastore::Configuration,
        path("/system"),
        json!({"contact": "noc"}),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        device.read(Datastore::Configuration, &path("/system")),
        Some(json!({"hostname": "edge-1.lab", "contact": "noc"}))
    );
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_loss_reconnects_within_the_same_tenure() {
    let cluster = TestCluster::with_nodes(&["node-a", "node-b"]);
    let (device, config) = cluster.add_device("edge-1");
    let id = config.id();
    cluster.mount_everywhere(&config).await;
    let owner = cluster.settle(&id).await;
    let epoch = cluster.status.get(&id).unwrap().owner_epoch;
    let connects = device.connect_count();
    let follower = cluster.followers(&id)[0].clone();
    let previous = cluster.mount(follower.address(), &id);

    device.drop_sessions();
    eventually(SETTLE, "owner reconnects", || {
        device.connect_count() > connects && device.live_sessions() == 1
    })
    .await;
    let again = cluster.settle(&id).await;
    assert_eq!(again.address(), owner.address());
    let record = cluster.status.get(&id).unwrap();
    assert!(record.connected);
    assert_eq!(record.owner_epoch, epoch);

    remounted(&cluster, follower.address(), &id, &previous).await;
    let mount = cluster.mount(follower.address(), &id);
    let tx = mount.new_write_transaction().unwrap();
    tx.put(Datastore::Configuration, path("/ntp/enabled"), json!(true))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        device.read(Datastore::Configuration, &path("/ntp/enabled")),
        Some(json!(true))
    );
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_device_is_released_by_every_candidate() {
    let cluster = TestCluster::with_nodes(&["node-a", "node-b"]);
    let (device, config) = cluster.add_device("edge-1");
    let id = config.id();
    cluster.mount_everywhere(&config).await;
    cluster.settle(&id).await;

    device.set_reachable(false);
    device.drop_sessions();
    eventually(SETTLE, "every candidate withdraws", || {
        cluster.ownership.candidates(&id).is_empty()
    })
    .await;
    eventually(SETTLE, "failure recorded", || {
        cluster
            .status
            .get(&id)
            .map(|record| !record.connected && record.failure_cause.is_some())
            .unwrap_or(false)
    })
    .await;
    eventually(SETTLE, "mounts removed", || {
        cluster.nodes.iter().all(|node| node.mount_point(&id).is_none())
    })
    .await;
    for node in &cluster.nodes {
        assert_eq!(node.role(&id).await, Some(Role::Follower));
    }

    // A fresh registration picks the device up once it is back.
    device.set_reachable(true);
    for node in &cluster.nodes {
        node.refresh_device(config.clone()).await.unwrap();
    }
    cluster.settle(&id).await;
    assert!(cluster.status.get(&id).unwrap().connected);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mount_handles_from_a_crashed_owner_fail_as_cluster_errors() {
    let mut cluster = TestCluster::with_nodes(&["node-a", "node-b"]);
    let (_device, config) = cluster.add_device("edge-1");
    let id = config.id();
    cluster.mount_everywhere(&config).await;
    let owner = cluster.settle(&id).await;

    let follower = cluster.followers(&id)[0].clone();
    let stale = cluster.mount(follower.address(), &id);
    let tx = stale.new_write_transaction().unwrap();
    tx.put(Datastore::Configuration, path("/a"), json!(1))
        .await
        .unwrap();

    let crashed = owner.address().to_string();
    cluster.crash(&crashed).await;
    let err = tx.commit().await.unwrap_err();
    assert!(
        matches!(err, MountError::Closed(_)) || err.is_cluster_failure(),
        "unexpected error {err}"
    );

    let successor = cluster.settle(&id).await;
    assert_eq!(successor.address(), follower.address());
    assert!(stale.is_closed());
    cluster.shutdown().await;
}
