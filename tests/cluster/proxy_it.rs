#[path = "../support/endpoint.rs"]
mod endpoint;

use clustermount::{ClusterError, DataPath, Datastore, InvariantError, MountError, SourceId};
use endpoint::{EndpointHarness, ASK_TIMEOUT, OWNER};
use serde_json::json;
use std::time::{Duration, Instant};

fn path(raw: &str) -> DataPath {
    DataPath::parse(raw)
}

#[tokio::test]
async fn read_only_transaction_sees_committed_state() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);

    let writer = proxies.new_read_write().unwrap();
    writer
        .put(Datastore::Operational, path("/system/uptime"), json!(42))
        .await
        .unwrap();
    // Uncommitted edits are invisible, even to the writing transaction.
    assert_eq!(
        writer
            .read(Datastore::Operational, &path("/system/uptime"))
            .await
            .unwrap(),
        None
    );
    writer.commit().await.unwrap();

    let reader = proxies.new_read_only();
    assert_eq!(
        reader
            .read(Datastore::Operational, &path("/system/uptime"))
            .await
            .unwrap(),
        Some(json!(42))
    );
    assert!(reader
        .exists(Datastore::Operational, &path("/system"))
        .await
        .unwrap());
    assert!(!reader
        .exists(Datastore::Configuration, &path("/system"))
        .await
        .unwrap());
    assert!(reader.close());
    assert!(!reader.close());
}

#[tokio::test]
async fn commit_and_cancel_follow_the_handle_lifecycle() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);

    // Nothing written: commit succeeds without contacting the owner.
    let empty = proxies.new_read_write().unwrap();
    empty.commit().await.unwrap();
    empty.commit().await.unwrap();
    assert!(!empty.cancel().await.unwrap());
    drop(empty);

    let tx = proxies.new_read_write().unwrap();
    tx.put(Datastore::Configuration, path("/a"), json!(1))
        .await
        .unwrap();
    assert!(tx.cancel().await.unwrap());
    assert!(!tx.cancel().await.unwrap());
    assert!(matches!(
        tx.commit().await,
        Err(MountError::Invariant(InvariantError::TransactionClosed(_)))
    ));
    assert!(matches!(
        tx.put(Datastore::Configuration, path("/a"), json!(2)).await,
        Err(MountError::Invariant(InvariantError::StaleHandle(_)))
    ));
    assert_eq!(harness.device.read(Datastore::Configuration, &path("/a")), None);
    assert_eq!(harness.device.commit_count(), 0);
}

#[tokio::test]
async fn one_local_writer_per_proxy_set() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);

    let first = proxies.new_read_write().unwrap();
    assert!(matches!(
        proxies.new_read_write(),
        Err(MountError::Invariant(InvariantError::WriteInProgress))
    ));
    drop(first);
    proxies.new_read_write().unwrap();
}

#[tokio::test]
async fn dropping_an_open_writer_releases_the_owner_handle() {
    let mut harness = EndpointHarness::connected(None);
    let b = harness.follower("node-b");
    let c = harness.follower("node-c");
    let from_b = harness.proxies(&b);
    let from_c = harness.proxies(&c);

    let abandoned = from_b.new_read_write().unwrap();
    abandoned
        .put(Datastore::Configuration, path("/a"), json!(1))
        .await
        .unwrap();
    drop(abandoned);

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let tx = from_c.new_read_write().unwrap();
        match tx.put(Datastore::Configuration, path("/a"), json!(2)).await {
            Ok(()) => {
                tx.commit().await.unwrap();
                break;
            }
            Err(MountError::Invariant(InvariantError::WriteInProgress)) => {
                assert!(Instant::now() < deadline, "owner handle never released");
                drop(tx);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(err) => panic!("unexpected error {err}"),
        }
    }
    assert_eq!(
        harness.device.read(Datastore::Configuration, &path("/a")),
        Some(json!(2))
    );
}

#[tokio::test]
async fn closing_the_set_releases_its_open_writer() {
    let mut harness = EndpointHarness::connected(None);
    let b = harness.follower("node-b");
    let c = harness.follower("node-c");
    let from_b = harness.proxies(&b);
    let from_c = harness.proxies(&c);

    let writer = from_b.new_read_write().unwrap();
    writer
        .put(Datastore::Configuration, path("/a"), json!(1))
        .await
        .unwrap();
    from_b.close();
    assert!(matches!(writer.commit().await, Err(MountError::Closed(_))));
    drop(writer);

    let tx = from_c.new_read_write().unwrap();
    tx.put(Datastore::Configuration, path("/a"), json!(2))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        harness.device.read(Datastore::Configuration, &path("/a")),
        Some(json!(2))
    );
}

#[tokio::test]
async fn partition_surfaces_as_a_timeout() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);
    harness.fabric.partition("node-b", OWNER);

    let started = Instant::now();
    let err = proxies.new_read_only().read(Datastore::Configuration, &path("/a")).await.unwrap_err();
    assert!(err.is_timeout(), "unexpected error {err}");
    assert!(err.is_cluster_failure());
    assert!(started.elapsed() >= ASK_TIMEOUT);
    assert_eq!(follower.channel.pending_count(), 0);

    harness.fabric.heal("node-b", OWNER);
    proxies.open_mount_session().await.unwrap();
}

#[tokio::test]
async fn closing_the_set_cancels_outstanding_asks() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);
    harness.fabric.partition("node-b", OWNER);

    let waiting = {
        let proxies = proxies.clone();
        tokio::spawn(async move { proxies.open_mount_session().await })
    };
    while follower.channel.pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    proxies.close();
    assert!(matches!(
        waiting.await.unwrap(),
        Err(MountError::Cluster(ClusterError::Cancelled))
    ));
    assert!(matches!(
        proxies.new_read_write(),
        Err(MountError::Closed(_))
    ));
}

#[tokio::test]
async fn schema_sources_are_cached_on_the_follower() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);
    let source = SourceId::new("ietf-interfaces", Some("2018-02-20"));

    let provider = proxies.schema_sources();
    let text = provider.get(&source).await.unwrap();
    assert!(text.contains("ietf-interfaces"));
    let fetched = harness.device.schema_fetch_count();

    assert_eq!(provider.get(&source).await.unwrap(), text);
    assert_eq!(harness.device.schema_fetch_count(), fetched);
    assert!(follower.schema_cache.contains(&source));

    let missing = provider
        .get(&SourceId::new("acme-private", None))
        .await
        .unwrap_err();
    assert!(missing.is_device_failure());
}

#[tokio::test]
async fn actions_are_invoked_on_the_owner() {
    let mut harness = EndpointHarness::connected(None);
    let follower = harness.follower("node-b");
    let proxies = harness.proxies(&follower);

    let outcome = proxies
        .actions()
        .invoke(&path("/interfaces/eth0"), "reset", Some(json!({"hard": true})))
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(
        outcome.output,
        Some(json!({
            "path": "/interfaces/eth0",
            "action": "reset",
            "input": {"hard": true}
        }))
    );
}
