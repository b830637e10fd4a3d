//! Pre-built fleet, users and streams.

use crate::mock_store::MockStore;
use relay_orchestrator::config::RelayInstanceConfig;
use relay_orchestrator::registry::{InstanceRegistry, RelayInstance, Registry};
use relay_orchestrator::store::keys;
use relay_orchestrator::streams::{Party, Stream, StreamRepository};
use relay_orchestrator::users::{UserRepository, UserSession};
use std::sync::Arc;
use std::time::Duration;

/// SDP offer used by seeded streams.
pub const TEST_SDP_OFFER: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=offer\r\n";

/// Enabled instance config with endpoints derived from `host`.
pub fn instance_config(host: &str) -> RelayInstanceConfig {
    RelayInstanceConfig {
        host: host.to_string(),
        control_url: format!("http://{host}:8088"),
        event_url: format!("ws://{host}:8188"),
        telemetry_url: format!("http://{host}:9090/load"),
        secret: None,
        enabled: true,
    }
}

/// Registry entry for `host` with the given health.
pub fn instance(host: &str, cpu: u64, connected: bool) -> RelayInstance {
    RelayInstance {
        cpu,
        connected,
        ..RelayInstance::from_config(&instance_config(host))
    }
}

/// Write the shared registry directly.
pub fn seed_registry(store: &MockStore, instances: &[RelayInstance]) {
    let mut registry = Registry::default();
    for instance in instances {
        registry.insert(instance.clone());
    }
    store.put(
        keys::INSTANCE_REGISTRY,
        &serde_json::to_string(&registry).unwrap(),
    );
}

/// Read the shared registry directly.
pub fn stored_registry(store: &MockStore) -> Registry {
    serde_json::from_str(&store.value(keys::INSTANCE_REGISTRY).unwrap()).unwrap()
}

pub fn registry_for(store: &MockStore, configs: &[RelayInstanceConfig]) -> Arc<InstanceRegistry> {
    Arc::new(InstanceRegistry::new(
        store.shared(),
        store.lock(),
        Duration::from_millis(1000),
        configs,
    ))
}

/// Create a user session for transport connection `id`.
pub async fn seed_user(store: &MockStore, id: &str) -> UserSession {
    UserRepository::new(store.shared())
        .create(id, "127.0.0.1")
        .await
        .unwrap()
}

/// Create a stream presented by `presenter`, optionally pinned to `pin`.
pub async fn seed_stream(store: &MockStore, presenter: &UserSession, pin: Option<&str>) -> Stream {
    let repo = StreamRepository::new(store.shared());
    let id = repo.allocate_id().await.unwrap();
    let mut stream = Stream::new(
        id,
        Party::from_user(presenter, None),
        TEST_SDP_OFFER.to_string(),
    )
    .unwrap();
    stream.media_instance = pin.map(str::to_string);
    repo.save(&stream).await.unwrap();
    stream
}
