//! Integration tests for the instance registry and selection policy.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use relay_orchestrator::errors::OrchestratorError;
use relay_orchestrator::registry::CPU_UNKNOWN;
use relay_orchestrator::store::keys;
use relay_orchestrator::streams::StreamRepository;
use relay_test_utils::*;
use std::time::Duration;

fn fleet() -> Vec<relay_orchestrator::config::RelayInstanceConfig> {
    vec![instance_config("h1"), instance_config("h2")]
}

#[tokio::test]
async fn test_selects_lowest_cpu_and_pins_stream() {
    let store = MockStore::new();
    seed_registry(&store, &[instance("h1", 10, true), instance("h2", 5, true)]);
    let registry = registry_for(&store, &fleet());
    let alice = seed_user(&store, "alice").await;
    let stream = seed_stream(&store, &alice, None).await;

    let chosen = registry
        .select_instance_for_room(&stream.room_key())
        .await
        .unwrap();

    assert_eq!(chosen.host, "h2");
    let stored = StreamRepository::new(store.shared())
        .load(stream.id)
        .await
        .unwrap();
    assert_eq!(stored.media_instance.as_deref(), Some("h2"));
}

#[tokio::test]
async fn test_disconnected_instances_are_not_selected_by_load() {
    let store = MockStore::new();
    seed_registry(&store, &[instance("h1", 90, true), instance("h2", 1, false)]);
    let registry = registry_for(&store, &fleet());
    let alice = seed_user(&store, "alice").await;
    let stream = seed_stream(&store, &alice, None).await;

    let chosen = registry
        .select_instance_for_room(&stream.room_key())
        .await
        .unwrap();

    assert_eq!(chosen.host, "h1");
}

#[tokio::test]
async fn test_sticky_pin_wins_over_lower_load() {
    let store = MockStore::new();
    seed_registry(&store, &[instance("h1", 90, true), instance("h2", 5, true)]);
    let registry = registry_for(&store, &fleet());
    let alice = seed_user(&store, "alice").await;
    let stream = seed_stream(&store, &alice, Some("h1")).await;

    let chosen = registry
        .select_instance_for_room(&stream.room_key())
        .await
        .unwrap();

    assert_eq!(chosen.host, "h1");
}

#[tokio::test]
async fn test_pin_to_disabled_host_is_ignored() {
    let store = MockStore::new();
    let mut disabled = instance("h1", 1, true);
    disabled.enabled = false;
    seed_registry(&store, &[disabled, instance("h2", 50, true)]);
    let registry = registry_for(&store, &fleet());
    let alice = seed_user(&store, "alice").await;
    let stream = seed_stream(&store, &alice, Some("h1")).await;

    let chosen = registry
        .select_instance_for_room(&stream.room_key())
        .await
        .unwrap();

    assert_eq!(chosen.host, "h2");
}

#[tokio::test]
async fn test_cached_choice_survives_store_outage() {
    let store = MockStore::new();
    seed_registry(&store, &[instance("h1", 10, true), instance("h2", 5, true)]);
    let registry = registry_for(&store, &fleet());
    let alice = seed_user(&store, "alice").await;
    let stream = seed_stream(&store, &alice, None).await;
    let room = stream.room_key();

    let first = registry.select_instance_for_room(&room).await.unwrap();
    store.fail_key(keys::INSTANCE_REGISTRY);
    let second = registry.select_instance_for_room(&room).await.unwrap();

    assert_eq!(first.host, second.host);
}

#[tokio::test]
async fn test_falls_back_to_configured_instance_when_nothing_connected() {
    let store = MockStore::new();
    seed_registry(&store, &[instance("h1", 10, false), instance("h2", 5, false)]);
    let registry = registry_for(&store, &fleet());
    let alice = seed_user(&store, "alice").await;
    let stream = seed_stream(&store, &alice, None).await;

    let chosen = registry
        .select_instance_for_room(&stream.room_key())
        .await
        .unwrap();

    assert!(["h1", "h2"].contains(&chosen.host.as_str()));
}

#[tokio::test]
async fn test_falls_back_when_registry_unreadable() {
    let store = MockStore::new();
    store.put(keys::INSTANCE_REGISTRY, "{not json");
    let registry = registry_for(&store, &[instance_config("h1")]);
    let alice = seed_user(&store, "alice").await;
    let stream = seed_stream(&store, &alice, None).await;

    let chosen = registry
        .select_instance_for_room(&stream.room_key())
        .await
        .unwrap();

    assert_eq!(chosen.host, "h1");
    assert!(!store.is_locked(keys::INSTANCE_REGISTRY_LOCK));
}

#[tokio::test]
async fn test_no_configured_instance_is_unavailable() {
    let store = MockStore::new();
    seed_registry(&store, &[]);
    let registry = registry_for(&store, &[]);
    let alice = seed_user(&store, "alice").await;
    let stream = seed_stream(&store, &alice, None).await;

    let result = registry.select_instance_for_room(&stream.room_key()).await;

    assert!(matches!(result, Err(OrchestratorError::RelayUnavailable(_))));
}

#[tokio::test]
async fn test_instance_down_clears_pins_and_cache() {
    let store = MockStore::new();
    seed_registry(&store, &[instance("h1", 10, true), instance("h2", 50, true)]);
    let registry = registry_for(&store, &fleet());
    let alice = seed_user(&store, "alice").await;
    let bob = seed_user(&store, "bob").await;
    let on_h1 = seed_stream(&store, &alice, Some("h1")).await;
    let on_h2 = seed_stream(&store, &bob, Some("h2")).await;

    // Warm the cache
    let before = registry
        .select_instance_for_room(&on_h1.room_key())
        .await
        .unwrap();
    assert_eq!(before.host, "h1");

    let cleared = registry.handle_instance_down("h1").await.unwrap();
    assert_eq!(cleared, 1);

    let streams = StreamRepository::new(store.shared());
    assert_eq!(streams.load(on_h1.id).await.unwrap().media_instance, None);
    assert_eq!(
        streams.load(on_h2.id).await.unwrap().media_instance.as_deref(),
        Some("h2")
    );
    assert!(!stored_registry(&store).get("h1").unwrap().connected);

    let after = registry
        .select_instance_for_room(&on_h1.room_key())
        .await
        .unwrap();
    assert_eq!(after.host, "h2");
}

#[tokio::test]
async fn test_peek_releases_lock() {
    let store = MockStore::new();
    seed_registry(&store, &[instance("h1", 10, true)]);
    let registry = registry_for(&store, &[instance_config("h1")]);

    let snapshot = registry.peek().await.unwrap();

    assert_eq!(snapshot.len(), 1);
    assert!(!store.is_locked(keys::INSTANCE_REGISTRY_LOCK));
    assert_eq!(store.lock_acquisitions(), store.lock_releases());
}

#[tokio::test]
async fn test_dropped_guard_releases_lock() {
    let store = MockStore::new();
    seed_registry(&store, &[instance("h1", 10, true)]);
    let registry = registry_for(&store, &[instance_config("h1")]);

    {
        let mut guard = registry.acquire_for_update().await.unwrap();
        guard.registry_mut().get_mut("h1").unwrap().cpu = 99;
        assert!(store.is_locked(keys::INSTANCE_REGISTRY_LOCK));
    }

    for _ in 0..100 {
        if !store.is_locked(keys::INSTANCE_REGISTRY_LOCK) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(!store.is_locked(keys::INSTANCE_REGISTRY_LOCK));
    // Not committed
    assert_eq!(stored_registry(&store).get("h1").unwrap().cpu, 10);
}

#[tokio::test]
async fn test_commit_persists_and_releases() {
    let store = MockStore::new();
    seed_registry(&store, &[instance("h1", 10, true)]);
    let registry = registry_for(&store, &[instance_config("h1")]);

    let mut guard = registry.acquire_for_update().await.unwrap();
    guard.registry_mut().get_mut("h1").unwrap().cpu = 42;
    guard.commit().await.unwrap();

    assert_eq!(stored_registry(&store).get("h1").unwrap().cpu, 42);
    assert!(!store.is_locked(keys::INSTANCE_REGISTRY_LOCK));
}

#[tokio::test]
async fn test_refresh_from_config_merges_fleet() {
    let store = MockStore::new();
    seed_registry(&store, &[instance("h1", 42, true)]);
    let mut disabled = instance_config("h3");
    disabled.enabled = false;
    let configs = vec![instance_config("h1"), instance_config("h2"), disabled];
    let registry = registry_for(&store, &configs);

    registry.refresh_from_config(&configs).await.unwrap();

    let stored = stored_registry(&store);
    assert_eq!(stored.len(), 2);
    assert_eq!(stored.get("h1").unwrap().cpu, 42);
    assert!(stored.get("h1").unwrap().connected);
    assert_eq!(stored.get("h2").unwrap().cpu, CPU_UNKNOWN);
    assert!(stored.get("h3").is_none());
}

#[tokio::test]
async fn test_refresh_seeds_empty_store() {
    let store = MockStore::new();
    let configs = fleet();
    let registry = registry_for(&store, &configs);

    registry.refresh_from_config(&configs).await.unwrap();
    registry.reset_health("h1").await.unwrap();
    registry.set_cpu("h1", 12).await.unwrap();
    registry.mark_connected("h1").await.unwrap();

    let stored = stored_registry(&store);
    assert_eq!(stored.len(), 2);
    assert_eq!(stored.connected_count(), 1);
    assert_eq!(stored.get("h1").unwrap().cpu, 12);
    assert_eq!(registry.connected_count().await, 1);
}

#[tokio::test]
async fn test_corrupt_registry_is_a_store_error() {
    let store = MockStore::new();
    store.put(keys::INSTANCE_REGISTRY, "[1,2");
    let registry = registry_for(&store, &fleet());

    let result = registry.peek().await;

    assert!(matches!(result, Err(OrchestratorError::Store(_))));
    assert_eq!(registry.connected_count().await, 0);
}

#[tokio::test]
async fn test_instance_down_clears_pins_when_registry_is_locked_out() {
    let store = MockStore::new();
    seed_registry(&store, &[instance("h1", 10, true), instance("h2", 50, true)]);
    let registry = registry_for(&store, &fleet());
    let alice = seed_user(&store, "alice").await;
    let stream = seed_stream(&store, &alice, Some("h1")).await;
    store.fail_locks(true);

    let cleared = registry.handle_instance_down("h1").await.unwrap();

    assert_eq!(cleared, 1);
    let streams = StreamRepository::new(store.shared());
    assert_eq!(streams.load(stream.id).await.unwrap().media_instance, None);
}
