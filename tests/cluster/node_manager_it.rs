#[path = "../support/endpoint.rs"]
mod endpoint;

use clustermount::mount::node_manager::Transition;
use clustermount::node::NodeRuntime;
use clustermount::{
    ConnectionStatusRecord, DataPath, Datastore, MountFacade, NodeManager, StatusEvent,
    StatusStore,
};
use endpoint::{device_id, EndpointHarness, ASK_TIMEOUT, EPOCH, OWNER};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn manager(follower: &Arc<NodeRuntime>) -> NodeManager {
    let facade = MountFacade::new(
        device_id(),
        follower.address.clone(),
        Arc::clone(&follower.mounts),
    );
    NodeManager::new(device_id(), ASK_TIMEOUT, Arc::clone(follower), facade)
}

fn connected(owner: &str, epoch: u64, harness: &EndpointHarness) -> StatusEvent {
    StatusEvent::Updated(ConnectionStatusRecord::connected(
        device_id(),
        owner,
        epoch,
        harness.device.capabilities(),
    ))
}

async fn wait_for<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn owner_changes_rebuild_once_each_and_disconnect_tears_down() {
    let mut harness = EndpointHarness::connected(None);
    harness.add_owner("node-b", EPOCH + 1);
    let follower = harness.follower("node-c");
    let nm = manager(&follower);

    assert_eq!(nm.apply(connected(OWNER, EPOCH, &harness)).await, Transition::Connected);
    assert_eq!(nm.apply(connected(OWNER, EPOCH, &harness)).await, Transition::Ignored);
    let mount = follower.mounts.get(&device_id()).unwrap();
    assert!(!mount.is_owner());
    assert_eq!(nm.current_owner().unwrap().address, OWNER);

    assert_eq!(
        nm.apply(connected("node-b", EPOCH + 1, &harness)).await,
        Transition::Connected
    );
    assert_eq!(
        nm.apply(connected("node-b", EPOCH + 1, &harness)).await,
        Transition::Ignored
    );
    assert!(mount.is_closed(), "previous follower mount is discarded");
    assert_eq!(nm.current_owner().unwrap().address, "node-b");

    let down = StatusEvent::Updated(ConnectionStatusRecord::connecting(
        device_id(),
        "node-b",
        EPOCH + 1,
    ));
    assert_eq!(nm.apply(down.clone()).await, Transition::Disconnected);
    assert_eq!(nm.apply(down).await, Transition::Ignored);
    assert_eq!(
        nm.apply(StatusEvent::Removed(device_id())).await,
        Transition::Ignored
    );

    assert!(follower.mounts.get(&device_id()).is_none());
    assert!(nm.current_owner().is_none());
    assert_eq!(nm.rebuild_count(), 2);
}

#[tokio::test]
async fn capability_change_keeps_the_proxies() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-c");
    let nm = manager(&follower);

    assert_eq!(nm.apply(connected(OWNER, EPOCH, &harness)).await, Transition::Connected);
    let mut record = ConnectionStatusRecord::connected(
        device_id(),
        OWNER,
        EPOCH,
        harness.device.capabilities(),
    );
    record.capabilities.insert("urn:example:extra".into());
    assert_eq!(
        nm.apply(StatusEvent::Updated(record)).await,
        Transition::StatusChanged
    );
    assert_eq!(nm.rebuild_count(), 1);
    assert!(follower.mounts.get(&device_id()).is_some());
}

#[tokio::test]
async fn record_naming_this_node_is_not_followed() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-c");
    let nm = manager(&follower);

    assert_eq!(
        nm.apply(connected("node-c", EPOCH, &harness)).await,
        Transition::Ignored
    );
    assert!(follower.mounts.get(&device_id()).is_none());
    assert_eq!(nm.rebuild_count(), 0);
}

#[tokio::test]
async fn unreachable_owner_leaves_no_mount() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-c");
    harness.fabric.partition("node-c", OWNER);
    let nm = manager(&follower);

    assert_eq!(
        nm.apply(connected(OWNER, EPOCH, &harness)).await,
        Transition::Disconnected
    );
    assert!(follower.mounts.get(&device_id()).is_none());
    assert_eq!(nm.rebuild_count(), 1);
}

#[tokio::test]
async fn running_manager_follows_the_status_store_and_retries() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-c");
    harness.fabric.partition("node-c", OWNER);
    follower
        .status
        .publish(ConnectionStatusRecord::connected(
            device_id(),
            OWNER,
            EPOCH,
            harness.device.capabilities(),
        ))
        .unwrap();

    let nm = manager(&follower);
    nm.start();
    assert!(nm.is_running());
    tokio::time::sleep(ASK_TIMEOUT + Duration::from_millis(100)).await;
    assert!(follower.mounts.get(&device_id()).is_none());

    harness.fabric.heal("node-c", OWNER);
    wait_for("follower mount after heal", || {
        follower.mounts.get(&device_id()).is_some()
    })
    .await;

    let mount = follower.mounts.get(&device_id()).unwrap();
    let tx = mount.new_write_transaction().unwrap();
    tx.put(Datastore::Configuration, DataPath::parse("/ntp/server"), json!("192.0.2.1"))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        mount
            .read(Datastore::Configuration, &DataPath::parse("/ntp/server"))
            .await
            .unwrap(),
        Some(json!("192.0.2.1"))
    );

    let mut events = mount.subscribe_notifications();
    harness.device.emit_notification("ntp", json!({"synced": true}));
    let notification = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.body, json!({"synced": true}));

    follower.status.remove(&device_id(), EPOCH).unwrap();
    wait_for("mount torn down after removal", || {
        follower.mounts.get(&device_id()).is_none()
    })
    .await;

    nm.stop().await;
    nm.stop().await;
    assert!(!nm.is_running());
}
