use clustermount::session::schema::SchemaSourceCache;
use clustermount::session::{DeviceHandler, SessionDependencies};
use clustermount::{
    CapabilitySet, Credentials, DeviceConfig, DeviceSession, DeviceSessionManager,
    KeystoreCredentialStore, PinFuture, SessionError, SimulatedConnector, SimulatedDevice,
    SourceId,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

#[derive(Debug)]
enum Event {
    Connected {
        capabilities: CapabilitySet,
        sources: Vec<SourceId>,
    },
    Disconnected,
    Failed(String),
}

struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

impl DeviceHandler for Recorder {
    fn on_connected(
        &self,
        _session: Arc<dyn DeviceSession>,
        capabilities: CapabilitySet,
        sources: Vec<SourceId>,
    ) -> PinFuture<()> {
        let _ = self.events.send(Event::Connected {
            capabilities,
            sources,
        });
        Box::pin(async {})
    }

    fn on_disconnected(&self) -> PinFuture<()> {
        let _ = self.events.send(Event::Disconnected);
        Box::pin(async {})
    }

    fn on_failed(&self, cause: String) -> PinFuture<()> {
        let _ = self.events.send(Event::Failed(cause));
        Box::pin(async {})
    }
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
    let (events, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { events }), rx)
}

async fn next(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("handler event")
        .expect("handler alive")
}

fn config(credentials: Credentials) -> DeviceConfig {
    let mut config = DeviceConfig::new("edge-1", "192.0.2.10", 830, credentials);
    config.connection_timeout_ms = 200;
    config.default_request_timeout_ms = 100;
    config.reconnect.max_connection_attempts = 3;
    config.reconnect.between_attempts_timeout_ms = 20;
    config.reconnect.max_timeout_between_attempts_ms = 50;
    config
}

fn admin() -> Credentials {
    Credentials::LoginPassword {
        username: "admin".into(),
        password: "admin".into(),
    }
}

struct Fixture {
    device: SimulatedDevice,
    connector: Arc<SimulatedConnector>,
    credentials: Arc<KeystoreCredentialStore>,
    cache: Arc<SchemaSourceCache>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_keystore(KeystoreCredentialStore::without_master_key())
    }

    fn with_keystore(store: KeystoreCredentialStore) -> Self {
        let connector = SimulatedConnector::new();
        let device = SimulatedDevice::new(config(admin()).id());
        device.require_login("admin", "admin");
        connector.add(device.clone());
        Self {
            device,
            connector,
            credentials: Arc::new(store),
            cache: SchemaSourceCache::in_memory(),
        }
    }

    fn manager(&self, config: DeviceConfig) -> DeviceSessionManager {
        DeviceSessionManager::new(
            config,
            SessionDependencies {
                connector: self.connector.clone(),
                credentials: self.credentials.clone(),
                schema_cache: Arc::clone(&self.cache),
            },
        )
    }
}

#[tokio::test]
async fn connect_reports_capabilities_and_resolved_sources() {
    let fixture = Fixture::new();
    let manager = fixture.manager(config(admin()));
    let (handler, mut events) = recorder();

    let capabilities = manager.connect(handler).await.unwrap();
    assert_eq!(capabilities, fixture.device.capabilities());
    match next(&mut events).await {
        Event::Connected {
            capabilities: reported,
            sources,
        } => {
            assert_eq!(reported, capabilities);
            assert_eq!(
                sources,
                vec![SourceId::new("ietf-interfaces", Some("2018-02-20"))]
            );
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(manager.current_session().is_some());
    assert_eq!(fixture.device.live_sessions(), 1);

    manager.stop().await;
    assert!(manager.current_session().is_none());
    assert_eq!(fixture.device.live_sessions(), 0);
}

#[tokio::test]
async fn unreachable_device_is_retried_until_it_answers() {
    let fixture = Fixture::new();
    let mut config = config(admin());
    config.reconnect.max_connection_attempts = 20;
    let manager = fixture.manager(config);
    let (handler, mut events) = recorder();

    fixture.device.set_reachable(false);
    manager.spawn_connect(handler);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(fixture.device.connect_count(), 0);
    fixture.device.set_reachable(true);

    assert!(matches!(next(&mut events).await, Event::Connected { .. }));
    assert_eq!(fixture.device.connect_count(), 1);
    manager.stop().await;
}

#[tokio::test]
async fn exhausted_attempts_end_in_failure() {
    let fixture = Fixture::new();
    let manager = fixture.manager(config(admin()));
    let (handler, mut events) = recorder();

    fixture.device.set_reachable(false);
    let err = manager.connect(handler).await.unwrap_err();
    assert!(matches!(err, SessionError::Exhausted { attempts: 3, .. }));
    match next(&mut events).await {
        Event::Failed(cause) => assert!(cause.contains("3 attempts"), "{cause}"),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(manager.current_session().is_none());
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let fixture = Fixture::new();
    let manager = fixture.manager(config(Credentials::LoginPassword {
        username: "admin".into(),
        password: "guess".into(),
    }));
    let (handler, mut events) = recorder();

    assert!(manager.connect(handler).await.is_err());
    assert!(matches!(next(&mut events).await, Event::Failed(_)));
    assert_eq!(fixture.device.connect_count(), 0);
}

#[tokio::test]
async fn encrypted_password_is_decrypted_through_the_keystore() {
    let fixture = Fixture::with_keystore(KeystoreCredentialStore::new(&[9u8; 32]));
    let encrypted_password = fixture.credentials.encrypt("admin").unwrap();
    let manager = fixture.manager(config(Credentials::LoginPasswordEncrypted {
        username: "admin".into(),
        encrypted_password,
    }));
    let (handler, mut events) = recorder();

    manager.connect(handler).await.unwrap();
    assert!(matches!(next(&mut events).await, Event::Connected { .. }));
    manager.stop().await;

    // A keystore without the master key cannot recover the password.
    let locked = Fixture::new();
    let encrypted_password = fixture.credentials.encrypt("admin").unwrap();
    let manager = locked.manager(config(Credentials::LoginPasswordEncrypted {
        username: "admin".into(),
        encrypted_password,
    }));
    let (handler, mut events) = recorder();
    let err = manager.connect(handler).await.unwrap_err();
    assert!(matches!(err, SessionError::Credentials(_)));
    assert!(matches!(next(&mut events).await, Event::Failed(_)));
}

#[tokio::test]
async fn dropped_session_is_reestablished() {
    let fixture = Fixture::new();
    let manager = fixture.manager(config(admin()));
    let (handler, mut events) = recorder();

    manager.connect(handler).await.unwrap();
    assert!(matches!(next(&mut events).await, Event::Connected { .. }));

    fixture.device.drop_sessions();
    assert!(matches!(next(&mut events).await, Event::Disconnected));
    assert!(matches!(next(&mut events).await, Event::Connected { .. }));
    assert_eq!(fixture.device.connect_count(), 2);
    assert_eq!(fixture.device.live_sessions(), 1);
    manager.stop().await;
}

#[tokio::test]
async fn reconnect_failure_after_loss_is_terminal() {
    let fixture = Fixture::new();
    let manager = fixture.manager(config(admin()));
    let (handler, mut events) = recorder();

    manager.connect(handler).await.unwrap();
    assert!(matches!(next(&mut events).await, Event::Connected { .. }));

    fixture.device.set_reachable(false);
    fixture.device.drop_sessions();
    assert!(matches!(next(&mut events).await, Event::Disconnected));
    assert!(matches!(next(&mut events).await, Event::Failed(_)));
    assert!(manager.current_session().is_none());
}

#[tokio::test]
async fn stalled_keepalive_is_treated_as_session_loss() {
    let fixture = Fixture::new();
    let mut config = config(admin());
    config.keepalive_delay_secs = 1;
    let manager = fixture.manager(config);
    let (handler, mut events) = recorder();

    manager.connect(handler).await.unwrap();
    assert!(matches!(next(&mut events).await, Event::Connected { .. }));

    fixture.device.stall_probes(true);
    assert!(matches!(next(&mut events).await, Event::Disconnected));
    fixture.device.stall_probes(false);
    assert!(matches!(next(&mut events).await, Event::Connected { .. }));
    assert_eq!(fixture.device.live_sessions(), 1);
    manager.stop().await;
}

#[tokio::test]
async fn schema_sources_come_from_cache_then_library_then_device() {
    let library = TempDir::new().unwrap();
    let vendor = SourceId::new("acme-system", Some("2024-01-01"));
    std::fs::write(
        library.path().join(vendor.file_name()),
        "module acme-system {}",
    )
    .unwrap();

    let fixture = Fixture::new();
    fixture.device.add_source(vendor.clone(), "module acme-system { device-copy; }");
    let interfaces = SourceId::new("ietf-interfaces", Some("2018-02-20"));
    let mut config = config(admin());
    config.yang_library_directory = Some(library.path().to_path_buf());

    let manager = fixture.manager(config.clone());
    let (handler, mut events) = recorder();
    manager.connect(handler).await.unwrap();
    match next(&mut events).await {
        Event::Connected { sources, .. } => {
            assert!(sources.contains(&vendor));
            assert!(sources.contains(&interfaces));
        }
        other => panic!("unexpected event {other:?}"),
    }
    // The library copy wins over the device copy; only the other source
    // had to be fetched from the device.
    assert_eq!(fixture.device.schema_fetch_count(), 1);
    assert_eq!(fixture.cache.get(&vendor).unwrap(), "module acme-system {}");
    assert!(fixture.cache.contains(&interfaces));
    manager.stop().await;

    // A second manager sharing the cache never asks the device.
    let again = fixture.manager(config);
    let (handler, mut events) = recorder();
    again.connect(handler).await.unwrap();
    assert!(matches!(next(&mut events).await, Event::Connected { .. }));
    assert_eq!(fixture.device.schema_fetch_count(), 1);
    again.stop().await;
}

#[tokio::test]
async fn configured_hello_capabilities_replace_the_advertised_set() {
    let fixture = Fixture::new();
    let mut config = config(admin());
    config.hello_capabilities = Some(vec![
        "urn:ietf:params:netconf:base:1.1".into(),
        "urn:example:restricted".into(),
    ]);
    let manager = fixture.manager(config);
    let (handler, _events) = recorder();

    let capabilities = manager.connect(handler).await.unwrap();
    let expected: CapabilitySet = ["urn:ietf:params:netconf:base:1.1", "urn:example:restricted"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(capabilities, expected);
    manager.stop().await;
}

#[tokio::test]
async fn stop_aborts_a_pending_connect() {
    let fixture = Fixture::new();
    let mut config = config(admin());
    config.reconnect.max_connection_attempts = 1000;
    let manager = fixture.manager(config);
    let (handler, mut events) = recorder();

    fixture.device.set_reachable(false);
    manager.spawn_connect(handler);
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.stop().await;
    fixture.device.set_reachable(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(fixture.device.connect_count(), 0);
}
