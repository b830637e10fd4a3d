//! Instance Registry & Load Balancer.
//!
//! The registry maps relay host to live health (`cpu`, `connected`) and is
//! persisted as a single JSON record in the shared store. Every process in
//! the fleet reads and writes the same record, so multi-field updates happen
//! inside `instance-registry-lock`:
//!
//! - [`InstanceRegistry::peek`] takes the lock, reads a snapshot and releases
//!   the lock before returning.
//! - [`InstanceRegistry::acquire_for_update`] returns a [`RegistryGuard`] that
//!   owns the lock until [`RegistryGuard::release`] or
//!   [`RegistryGuard::commit`] consumes it.
//!
//! Room placement is memoized twice: on the stream record (`mediaInstance`,
//! authoritative) and in a process-local cache (a hint). Every site that
//! clears a pin also evicts the cache entry.

pub mod monitor;
pub mod selection;

use crate::config::RelayInstanceConfig;
use crate::errors::OrchestratorError;
use crate::observability::metrics;
use crate::store::{keys, DistributedLock, LockHandle, SharedStore};
use crate::streams::StreamRepository;
use common::types::{RoomKey, StreamId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// `cpu` sentinel for an instance whose load is unknown or unreachable.
pub const CPU_UNKNOWN: u64 = 100_000;

/// One relay server node and its live health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayInstance {
    /// Stable identity.
    pub host: String,
    pub control_url: String,
    pub event_url: String,
    pub telemetry_url: String,
    /// Last reported load, `CPU_UNKNOWN` until a sample arrives.
    pub cpu: u64,
    /// Event-stream link is up.
    pub connected: bool,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl RelayInstance {
    /// Fresh registry entry for a configured instance. Health starts unknown.
    #[must_use]
    pub fn from_config(config: &RelayInstanceConfig) -> Self {
        Self {
            host: config.host.clone(),
            control_url: config.control_url.clone(),
            event_url: config.event_url.clone(),
            telemetry_url: config.telemetry_url.clone(),
            cpu: CPU_UNKNOWN,
            connected: false,
            enabled: config.enabled,
        }
    }

    /// Eligible for lowest-load selection.
    #[must_use]
    pub fn is_selectable(&self) -> bool {
        self.connected && self.enabled
    }
}

/// host -> instance, iterated in host order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry(BTreeMap<String, RelayInstance>);

impl Registry {
    #[must_use]
    pub fn get(&self, host: &str) -> Option<&RelayInstance> {
        self.0.get(host)
    }

    pub fn get_mut(&mut self, host: &str) -> Option<&mut RelayInstance> {
        self.0.get_mut(host)
    }

    pub fn insert(&mut self, instance: RelayInstance) {
        self.0.insert(instance.host.clone(), instance);
    }

    pub fn instances(&self) -> impl Iterator<Item = &RelayInstance> {
        self.0.values()
    }

    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.0.values().filter(|i| i.is_selectable()).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Exclusive hold on the registry.
///
/// The lock is released exactly once: by [`RegistryGuard::release`],
/// [`RegistryGuard::commit`], or on drop (best effort, spawned).
pub struct RegistryGuard {
    registry: Registry,
    handle: Option<LockHandle>,
    store: Arc<dyn SharedStore>,
    lock: Arc<dyn DistributedLock>,
}

impl RegistryGuard {
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Persist the guarded registry without releasing the lock.
    pub async fn save(&self) -> Result<(), OrchestratorError> {
        write_registry(self.store.as_ref(), &self.registry).await
    }

    /// Release the lock.
    pub async fn release(mut self) -> Result<(), OrchestratorError> {
        match self.handle.take() {
            Some(handle) => self.lock.release(&handle).await,
            None => Ok(()),
        }
    }

    /// Save, then release. The lock is released even when the save fails.
    pub async fn commit(self) -> Result<(), OrchestratorError> {
        let saved = self.save().await;
        let released = self.release().await;
        saved.and(released)
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let lock = Arc::clone(&self.lock);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = lock.release(&handle).await {
                    warn!(target: "ro.registry", error = %e, "Failed to release registry lock on drop");
                }
            });
        }
    }
}

async fn write_registry(
    store: &dyn SharedStore,
    registry: &Registry,
) -> Result<(), OrchestratorError> {
    let raw = serde_json::to_string(registry)
        .map_err(|e| OrchestratorError::Internal(format!("serialize registry: {e}")))?;
    store.set(keys::INSTANCE_REGISTRY, &raw).await
}

/// Shared instance registry plus the room placement policy.
pub struct InstanceRegistry {
    store: Arc<dyn SharedStore>,
    lock: Arc<dyn DistributedLock>,
    lock_ttl: Duration,
    configured: Vec<RelayInstance>,
    streams: StreamRepository,
    room_cache: RwLock<HashMap<RoomKey, RelayInstance>>,
}

impl InstanceRegistry {
    /// `configured` is the operator's instance list; disabled entries are
    /// kept out of the random fallback pool.
    pub fn new(
        store: Arc<dyn SharedStore>,
        lock: Arc<dyn DistributedLock>,
        lock_ttl: Duration,
        configured: &[RelayInstanceConfig],
    ) -> Self {
        let streams = StreamRepository::new(Arc::clone(&store));
        Self {
            store,
            lock,
            lock_ttl,
            configured: configured
                .iter()
                .filter(|c| c.enabled)
                .map(RelayInstance::from_config)
                .collect(),
            streams,
            room_cache: RwLock::new(HashMap::new()),
        }
    }

    async fn read(&self) -> Result<Option<Registry>, OrchestratorError> {
        let Some(raw) = self.store.get(keys::INSTANCE_REGISTRY).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| OrchestratorError::Store(format!("corrupt instance registry: {e}")))
    }

    async fn lock_and_read(&self, allow_missing: bool) -> Result<RegistryGuard, OrchestratorError> {
        let handle = self
            .lock
            .acquire(keys::INSTANCE_REGISTRY_LOCK, self.lock_ttl)
            .await?;

        let registry = match self.read().await {
            Ok(Some(registry)) => Ok(registry),
            Ok(None) if allow_missing => Ok(Registry::default()),
            Ok(None) => Err(OrchestratorError::NotFound("instance registry".to_string())),
            Err(e) => Err(e),
        };

        match registry {
            Ok(registry) => Ok(RegistryGuard {
                registry,
                handle: Some(handle),
                store: Arc::clone(&self.store),
                lock: Arc::clone(&self.lock),
            }),
            Err(e) => {
                if let Err(release_err) = self.lock.release(&handle).await {
                    warn!(target: "ro.registry", error = %release_err, "Failed to release registry lock");
                }
                Err(e)
            }
        }
    }

    /// Consistent snapshot. The lock is released before returning.
    ///
    /// # Errors
    ///
    /// `NotFound` if the registry has not been seeded, `Store` on store or
    /// lock failure or a corrupt record.
    pub async fn peek(&self) -> Result<Registry, OrchestratorError> {
        let guard = self.lock_and_read(false).await?;
        let snapshot = guard.registry().clone();
        if let Err(e) = guard.release().await {
            warn!(target: "ro.registry", error = %e, "Failed to release registry lock after peek");
        }
        Ok(snapshot)
    }

    /// Exclusive read-modify-write access. The caller must save before
    /// releasing; [`RegistryGuard::commit`] does both.
    pub async fn acquire_for_update(&self) -> Result<RegistryGuard, OrchestratorError> {
        self.lock_and_read(false).await
    }

    /// Persist a registry. Does not lock.
    pub async fn save(&self, registry: &Registry) -> Result<(), OrchestratorError> {
        write_registry(self.store.as_ref(), registry).await
    }

    /// Merge the configured instances into the persisted registry.
    ///
    /// Known hosts keep their live health; their endpoints and `enabled`
    /// flag follow the configuration. Unknown hosts are added only when
    /// enabled.
    #[instrument(skip_all)]
    pub async fn refresh_from_config(
        &self,
        configured: &[RelayInstanceConfig],
    ) -> Result<(), OrchestratorError> {
        let mut guard = self.lock_and_read(true).await?;
        let registry = guard.registry_mut();

        for config in configured {
            match registry.get_mut(&config.host) {
                Some(known) => {
                    known.control_url.clone_from(&config.control_url);
                    known.event_url.clone_from(&config.event_url);
                    known.telemetry_url.clone_from(&config.telemetry_url);
                    known.enabled = config.enabled;
                }
                None if config.enabled => registry.insert(RelayInstance::from_config(config)),
                None => {}
            }
        }

        let total = registry.len();
        metrics::set_instances_connected(registry.connected_count());
        guard.commit().await?;

        info!(target: "ro.registry", instances = total, "Instance registry seeded from configuration");
        Ok(())
    }

    /// Apply `mutate` to one instance under the lock. Returns the updated
    /// instance, or `None` if the host is not in the registry.
    async fn update_instance<F>(
        &self,
        host: &str,
        mutate: F,
    ) -> Result<Option<RelayInstance>, OrchestratorError>
    where
        F: FnOnce(&mut RelayInstance) + Send,
    {
        let mut guard = self.acquire_for_update().await?;
        let Some(instance) = guard.registry_mut().get_mut(host) else {
            guard.release().await?;
            return Ok(None);
        };
        mutate(instance);
        let updated = instance.clone();
        let connected = guard.registry().connected_count();

        guard.commit().await?;
        metrics::set_instances_connected(connected);
        Ok(Some(updated))
    }

    /// Reset an instance to unknown health before its monitors report.
    pub async fn reset_health(&self, host: &str) -> Result<(), OrchestratorError> {
        self.update_instance(host, |instance| {
            instance.cpu = CPU_UNKNOWN;
            instance.connected = false;
        })
        .await?;
        Ok(())
    }

    pub async fn set_cpu(&self, host: &str, cpu: u64) -> Result<(), OrchestratorError> {
        self.update_instance(host, |instance| instance.cpu = cpu)
            .await?;
        metrics::set_instance_cpu(host, cpu);
        Ok(())
    }

    pub async fn mark_connected(&self, host: &str) -> Result<(), OrchestratorError> {
        self.update_instance(host, |instance| instance.connected = true)
            .await?;
        info!(target: "ro.registry", host = %host, "Relay instance connected");
        Ok(())
    }

    pub async fn mark_disconnected(&self, host: &str) -> Result<(), OrchestratorError> {
        self.update_instance(host, |instance| instance.connected = false)
            .await?;
        warn!(target: "ro.registry", host = %host, "Relay instance marked disconnected");
        Ok(())
    }

    /// Event stream to `host` closed: mark it down and release every room
    /// pinned to it so the next attach picks another instance.
    #[instrument(skip_all, fields(host = %host))]
    pub async fn handle_instance_down(&self, host: &str) -> Result<usize, OrchestratorError> {
        if let Err(e) = self.mark_disconnected(host).await {
            warn!(target: "ro.registry", host = %host, error = %e, "Failed to mark instance down, clearing pins anyway");
        }
        self.clear_pins_for_host(host).await
    }

    /// Clear `mediaInstance` on every stream pinned to `host` and evict the
    /// matching cache entries. Returns the number of streams unpinned.
    pub async fn clear_pins_for_host(&self, host: &str) -> Result<usize, OrchestratorError> {
        self.room_cache
            .write()
            .await
            .retain(|_, instance| instance.host != host);

        let mut cleared = 0;
        for field in self.streams.list_fields().await? {
            let Ok(id) = field.parse::<StreamId>() else {
                continue;
            };
            let stream = match self.streams.load(id).await {
                Ok(stream) => stream,
                Err(OrchestratorError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(target: "ro.registry", stream = %id, error = %e, "Skipping unreadable stream while clearing pins");
                    continue;
                }
            };
            if stream.media_instance.as_deref() == Some(host) {
                self.streams.clear_pin(id).await?;
                self.invalidate_room(&stream.room_key()).await;
                cleared += 1;
            }
        }

        if cleared > 0 {
            info!(target: "ro.registry", host = %host, streams = cleared, "Cleared instance pins");
        }
        Ok(cleared)
    }

    /// Evict a room from the local placement cache.
    pub async fn invalidate_room(&self, room: &RoomKey) {
        self.room_cache.write().await.remove(room);
    }

    /// Number of selectable instances, 0 if the registry cannot be read.
    pub async fn connected_count(&self) -> usize {
        match self.peek().await {
            Ok(registry) => registry.connected_count(),
            Err(e) => {
                debug!(target: "ro.registry", error = %e, "Registry unavailable for connected count");
                0
            }
        }
    }

    /// Pick the relay instance that serves `room`.
    ///
    /// Order: local cache, live sticky pin on the stream, lowest-load
    /// connected instance, random configured instance. The choice is pinned
    /// onto the stream and cached.
    ///
    /// # Errors
    ///
    /// `RelayUnavailable` only when no instance is configured at all.
    #[instrument(skip_all, fields(room = %room))]
    pub async fn select_instance_for_room(
        &self,
        room: &RoomKey,
    ) -> Result<RelayInstance, OrchestratorError> {
        if let Some(cached) = self.room_cache.read().await.get(room).cloned() {
            metrics::record_instance_selection("cached");
            return Ok(cached);
        }

        let registry = match self.peek().await {
            Ok(registry) => registry,
            Err(e) => {
                warn!(target: "ro.registry", room = %room, error = %e, "Registry unreadable, falling back to random instance");
                metrics::record_selection_fallback("store_error");
                let chosen = self.random_configured()?;
                self.remember(room, &chosen).await;
                return Ok(chosen);
            }
        };

        if let Some(pinned) = self.live_pin(room, &registry).await {
            metrics::record_instance_selection("sticky");
            debug!(target: "ro.registry", room = %room, host = %pinned.host, "Reusing pinned instance");
            self.room_cache
                .write()
                .await
                .insert(room.clone(), pinned.clone());
            return Ok(pinned);
        }

        let chosen = if let Some(best) = selection::lowest_load(&registry) {
            metrics::record_instance_selection("lowest_load");
            best.clone()
        } else {
            warn!(target: "ro.registry", room = %room, "No connected relay instance, falling back to random instance");
            metrics::record_selection_fallback("no_connected");
            self.random_configured()?
        };

        debug!(target: "ro.registry", room = %room, host = %chosen.host, cpu = chosen.cpu, "Selected relay instance");
        self.remember(room, &chosen).await;
        Ok(chosen)
    }

    fn random_configured(&self) -> Result<RelayInstance, OrchestratorError> {
        metrics::record_instance_selection("fallback");
        selection::random_instance(&self.configured)
            .cloned()
            .ok_or_else(|| OrchestratorError::RelayUnavailable("no relay instance configured".to_string()))
    }

    /// The stream's pin, if it is set, the stream has participants and the
    /// host is still in the registry.
    async fn live_pin(&self, room: &RoomKey, registry: &Registry) -> Option<RelayInstance> {
        let id = room.stream_id()?;
        let stream = match self.streams.load(id).await {
            Ok(stream) => stream,
            Err(OrchestratorError::NotFound(_)) => return None,
            Err(e) => {
                warn!(target: "ro.registry", room = %room, error = %e, "Stream unreadable, selecting without pin");
                return None;
            }
        };

        if stream.active_participants() == 0 {
            return None;
        }
        let host = stream.media_instance.as_deref()?;
        registry.get(host).filter(|i| i.enabled).cloned()
    }

    /// Pin the choice onto the stream (best effort) and cache it.
    async fn remember(&self, room: &RoomKey, chosen: &RelayInstance) {
        if let Some(id) = room.stream_id() {
            let host = chosen.host.clone();
            match self
                .streams
                .update(id, move |stream| stream.media_instance = Some(host))
                .await
            {
                Ok(_) | Err(OrchestratorError::NotFound(_)) => {}
                Err(e) => {
                    warn!(target: "ro.registry", room = %room, error = %e, "Failed to persist instance pin");
                }
            }
        }

        self.room_cache
            .write()
            .await
            .insert(room.clone(), chosen.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_serializes_as_host_map() {
        let mut registry = Registry::default();
        registry.insert(RelayInstance {
            host: "relay-1".to_string(),
            control_url: "http://relay-1:8088".to_string(),
            event_url: "ws://relay-1:8188".to_string(),
            telemetry_url: "http://relay-1:7088/load".to_string(),
            cpu: 12,
            connected: true,
            enabled: true,
        });

        let json = serde_json::to_value(&registry).unwrap();
        assert_eq!(json["relay-1"]["cpu"], 12);
        assert_eq!(json["relay-1"]["controlUrl"], "http://relay-1:8088");

        let back: Registry = serde_json::from_value(json).unwrap();
        assert_eq!(back, registry);
        assert_eq!(back.connected_count(), 1);
    }

    #[test]
    fn test_enabled_defaults_to_true_for_older_records() {
        let raw = r#"{"h1":{"host":"h1","controlUrl":"c","eventUrl":"e","telemetryUrl":"t","cpu":100000,"connected":false}}"#;
        let registry: Registry = serde_json::from_str(raw).unwrap();
        assert!(registry.get("h1").unwrap().enabled);
    }
}
