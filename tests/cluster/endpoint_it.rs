#[path = "../support/endpoint.rs"]
mod endpoint;

use clustermount::{
    ClusterError, DataPath, Datastore, DeviceError, EndpointRef, InvariantError, MountError,
};
use endpoint::{device_id, EndpointHarness, EPOCH, OWNER};
use serde_json::json;
use std::time::Duration;

fn path(raw: &str) -> DataPath {
    DataPath::parse(raw)
}

#[tokio::test]
async fn mount_session_advertises_capabilities_and_sources() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);

    let info = proxies.open_mount_session().await.unwrap();
    assert_eq!(info.capabilities, harness.device.capabilities());
    assert_eq!(info.sources.len(), 1);
    assert_eq!(info.sources[0].name, "ietf-interfaces");
}

#[tokio::test]
async fn one_write_handle_across_followers() {
    let mut harness = EndpointHarness::connected(None);
    let b = harness.follower("node-b");
    let c = harness.follower("node-c");
    let from_b = harness.proxies(&b);
    let from_c = harness.proxies(&c);

    let tx_b = from_b.new_read_write().unwrap();
    tx_b.put(Datastore::Configuration, path("/system/hostname"), json!("b"))
        .await
        .unwrap();

    let tx_c = from_c.new_read_write().unwrap();
    let err = tx_c
        .put(Datastore::Configuration, path("/system/hostname"), json!("c"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MountError::Invariant(InvariantError::WriteInProgress)
    ));

    tx_b.commit().await.unwrap();
    assert_eq!(
        harness
            .device
            .read(Datastore::Configuration, &path("/system/hostname")),
        Some(json!("b"))
    );

    // The handle is free again once the holder committed.
    drop(tx_c);
    let retry = from_c.new_read_write().unwrap();
    retry
        .put(Datastore::Configuration, path("/system/hostname"), json!("c"))
        .await
        .unwrap();
    retry.commit().await.unwrap();
    assert_eq!(
        harness
            .device
            .read(Datastore::Configuration, &path("/system/hostname")),
        Some(json!("c"))
    );
}

#[tokio::test]
async fn owner_and_follower_writers_contend_for_one_handle() {
    let mut harness = EndpointHarness::connected(None);
    let mount = harness.owner_mount();
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);
    let hostname = path("/system/hostname");

    let local = mount.new_write_transaction().unwrap();
    local
        .put(Datastore::Configuration, hostname.clone(), json!("owner"))
        .await
        .unwrap();
    let remote = proxies.new_read_write().unwrap();
    assert!(matches!(
        remote
            .put(Datastore::Configuration, hostname.clone(), json!("follower"))
            .await,
        Err(MountError::Invariant(InvariantError::WriteInProgress))
    ));
    local.commit().await.unwrap();
    assert_eq!(
        harness.device.read(Datastore::Configuration, &hostname),
        Some(json!("owner"))
    );
    drop(remote);

    // Same arbitration the other way round.
    let remote = proxies.new_read_write().unwrap();
    remote
        .put(Datastore::Configuration, hostname.clone(), json!("follower"))
        .await
        .unwrap();
    let second_local = mount.new_write_transaction().unwrap();
    assert!(matches!(
        second_local
            .put(Datastore::Configuration, hostname.clone(), json!("owner-again"))
            .await,
        Err(MountError::Invariant(InvariantError::WriteInProgress))
    ));
    remote.commit().await.unwrap();
    assert_eq!(
        harness.device.read(Datastore::Configuration, &hostname),
        Some(json!("follower"))
    );
}

#[tokio::test]
async fn closing_the_owner_mount_cancels_its_open_write() {
    let mut harness = EndpointHarness::connected(None);
    let mount = harness.owner_mount();
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);
    let location = path("/system/location");

    let tx = mount.new_write_transaction().unwrap();
    tx.put(Datastore::Configuration, location.clone(), json!("rack-4"))
        .await
        .unwrap();
    assert!(mount.close());
    assert!(matches!(tx.commit().await, Err(MountError::Closed(_))));
    assert!(matches!(
        mount.new_write_transaction(),
        Err(MountError::Closed(_))
    ));
    assert_eq!(harness.device.read(Datastore::Configuration, &location), None);

    let remote = proxies.new_read_write().unwrap();
    remote
        .put(Datastore::Configuration, location.clone(), json!("rack-6"))
        .await
        .unwrap();
    remote.commit().await.unwrap();
    assert_eq!(
        harness.device.read(Datastore::Configuration, &location),
        Some(json!("rack-6"))
    );
}

#[tokio::test]
async fn edits_apply_in_issuance_order() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);

    let tx = proxies.new_read_write().unwrap();
    for mtu in [1500, 9000, 1400] {
        tx.put(
            Datastore::Configuration,
            path("/interfaces/eth0/mtu"),
            json!(mtu),
        )
        .await
        .unwrap();
    }
    tx.merge(
        Datastore::Configuration,
        path("/interfaces/eth0"),
        json!({"enabled": true}),
    )
    .await
    .unwrap();
    tx.delete(Datastore::Configuration, path("/interfaces/eth0/enabled"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        harness
            .device
            .read(Datastore::Configuration, &path("/interfaces/eth0")),
        Some(json!({"mtu": 1400}))
    );
    assert_eq!(harness.device.commit_count(), 1);
}

#[tokio::test]
async fn commit_errors_from_the_device_pass_through() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);

    let tx = proxies.new_read_write().unwrap();
    tx.delete(Datastore::Configuration, path("/nothing/here"))
        .await
        .unwrap();
    let err = tx.commit().await.unwrap_err();
    assert!(err.is_device_failure());
    assert_eq!(err.rpc_errors()[0].tag, "data-missing");

    // A failed commit is terminal for the handle.
    assert!(matches!(
        tx.commit().await,
        Err(MountError::Invariant(InvariantError::TransactionClosed(_)))
    ));
    assert!(!tx.cancel().await.unwrap());
}

#[tokio::test]
async fn idle_write_handle_is_cancelled_by_the_owner() {
    let mut harness = EndpointHarness::connected(Some(Duration::from_millis(40)));
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);

    let tx = proxies.new_read_write().unwrap();
    tx.put(Datastore::Configuration, path("/a"), json!(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(
        err,
        MountError::Invariant(InvariantError::StaleHandle(_))
    ));
    assert_eq!(harness.device.read(Datastore::Configuration, &path("/a")), None);

    // Another transaction can take the released handle.
    let next = proxies.new_read_write().unwrap();
    next.put(Datastore::Configuration, path("/a"), json!(2))
        .await
        .unwrap();
    next.commit().await.unwrap();
}

#[tokio::test]
async fn requests_for_another_epoch_or_device_are_refused() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");

    let stale = harness.proxies_for(
        &follower,
        EndpointRef {
            address: OWNER.into(),
            device: device_id(),
            epoch: EPOCH + 1,
        },
    );
    let err = stale.open_mount_session().await.unwrap_err();
    assert!(matches!(err, MountError::Cluster(ClusterError::StaleOwner(_))));

    let mut other = device_id();
    other.name = "edge-2".into();
    let foreign = harness.proxies_for(
        &follower,
        EndpointRef {
            address: OWNER.into(),
            device: other,
            epoch: EPOCH,
        },
    );
    let err = foreign.open_mount_session().await.unwrap_err();
    assert!(matches!(err, MountError::Cluster(ClusterError::NotOwner(_))));
}

#[tokio::test]
async fn operations_without_a_session_report_unavailable() {
    let mut harness = EndpointHarness::start(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);

    let err = proxies.open_mount_session().await.unwrap_err();
    assert!(matches!(err, MountError::Device(DeviceError::Unavailable(_))));

    harness.attach_session();
    proxies.open_mount_session().await.unwrap();

    harness.endpoint.session_down();
    let err = proxies
        .rpc()
        .invoke("echo", Some(json!({"x": 1})))
        .await
        .unwrap_err();
    assert!(err.is_device_failure());
}

#[tokio::test]
async fn rpcs_and_notifications_reach_followers() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);

    let outcome = proxies
        .rpc()
        .invoke("echo", Some(json!({"ping": 1})))
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.output, Some(json!({"ping": 1})));

    let outcome = proxies.rpc().invoke("reboot", None).await.unwrap();
    assert!(!outcome.is_success());
    assert_eq!(outcome.errors[0].tag, "operation-not-supported");

    let mut stream = follower.notifications.sender(&device_id()).subscribe();
    proxies.subscribe_notifications(follower.address.as_str()).await.unwrap();
    harness
        .device
        .emit_notification("interfaces", json!({"eth0": "down"}));
    let received = tokio::time::timeout(Duration::from_secs(2), stream.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.stream, "interfaces");
    assert_eq!(received.body, json!({"eth0": "down"}));
}

#[tokio::test]
async fn shutdown_refuses_later_requests() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);

    let tx = proxies.new_read_write().unwrap();
    tx.put(Datastore::Configuration, path("/a"), json!(1))
        .await
        .unwrap();
    harness.endpoint.shutdown().await;
    assert!(!harness.endpoint.is_running());

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, MountError::Cluster(ref cluster) if cluster.is_stale_owner()));
    assert_eq!(harness.device.read(Datastore::Configuration, &path("/a")), None);
}
