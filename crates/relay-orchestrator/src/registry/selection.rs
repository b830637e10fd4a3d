//! Instance selection policies.
//!
//! Two policies, applied by [`super::InstanceRegistry::select_instance_for_room`]
//! after the cache and sticky-pin checks:
//!
//! - lowest load: the connected, enabled instance with the numerically
//!   lowest `cpu`; ties go to the first instance in registry order
//! - random: uniform pick, used only when nothing is connected or the
//!   registry could not be read

use super::{RelayInstance, Registry};
use rand::seq::IteratorRandom;

/// Connected, enabled instance with the lowest reported load.
#[must_use]
pub fn lowest_load(registry: &Registry) -> Option<&RelayInstance> {
    registry
        .instances()
        .filter(|instance| instance.is_selectable())
        .min_by_key(|instance| instance.cpu)
}

/// Uniformly random instance.
#[must_use]
pub fn random_instance<'a, I>(instances: I) -> Option<&'a RelayInstance>
where
    I: IntoIterator<Item = &'a RelayInstance>,
{
    instances.into_iter().choose(&mut rand::thread_rng())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::CPU_UNKNOWN;

    fn instance(host: &str, cpu: u64, connected: bool) -> RelayInstance {
        RelayInstance {
            host: host.to_string(),
            control_url: format!("http://{host}:8088"),
            event_url: format!("ws://{host}:8188"),
            telemetry_url: format!("http://{host}:7088/load"),
            cpu,
            connected,
            enabled: true,
        }
    }

    fn registry(instances: Vec<RelayInstance>) -> Registry {
        let mut registry = Registry::default();
        for instance in instances {
            registry.insert(instance);
        }
        registry
    }

    #[test]
    fn test_lowest_cpu_wins() {
        let registry = registry(vec![instance("h1", 10, true), instance("h2", 5, true)]);
        assert_eq!(lowest_load(&registry).unwrap().host, "h2");
    }

    #[test]
    fn test_disconnected_instances_are_skipped() {
        let registry = registry(vec![
            instance("h1", 40, true),
            instance("h2", 1, false),
            instance("h3", 90, true),
        ]);
        assert_eq!(lowest_load(&registry).unwrap().host, "h1");
    }

    #[test]
    fn test_disabled_instances_are_skipped() {
        let mut quiet = instance("h1", 0, true);
        quiet.enabled = false;
        let registry = registry(vec![quiet, instance("h2", 70, true)]);
        assert_eq!(lowest_load(&registry).unwrap().host, "h2");
    }

    #[test]
    fn test_ties_go_to_registry_order() {
        let registry = registry(vec![
            instance("relay-b", 20, true),
            instance("relay-a", 20, true),
            instance("relay-c", CPU_UNKNOWN, true),
        ]);
        assert_eq!(lowest_load(&registry).unwrap().host, "relay-a");
    }

    #[test]
    fn test_nothing_connected() {
        let registry = registry(vec![instance("h1", 10, false)]);
        assert!(lowest_load(&registry).is_none());
        assert!(lowest_load(&Registry::default()).is_none());
    }

    #[test]
    fn test_random_instance_picks_from_candidates() {
        let candidates = vec![instance("h1", 10, false), instance("h2", 10, false)];
        for _ in 0..20 {
            let picked = random_instance(&candidates).unwrap();
            assert!(picked.host == "h1" || picked.host == "h2");
        }
        assert!(random_instance(&Vec::<RelayInstance>::new()).is_none());
    }
}
