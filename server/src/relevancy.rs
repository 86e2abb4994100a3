//! Distance-based relevancy: is an entity in range of a viewer, and is
//! it due for an update.

use crate::registry::{EntityInfo, EntityRegistry};
use shared::{NetworkId, ReplicationConfig, Vec3};

/// Tolerance for comparing elapsed time against the tick interval, so
/// that accumulated float error never skips a tick.
const TIME_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy)]
pub struct RelevancyFilter {
    tick_interval: f64,
}

impl RelevancyFilter {
    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
        }
    }

    pub fn is_relevant(&self, registry: &EntityRegistry, id: NetworkId, viewer: Vec3) -> bool {
        registry
            .get(id)
            .map_or(false, |entity| Self::in_range(entity, viewer))
    }

    pub fn should_replicate(
        &self,
        registry: &EntityRegistry,
        id: NetworkId,
        viewer: Vec3,
        now: f64,
    ) -> bool {
        match registry.get(id) {
            Some(entity) => {
                Self::in_range(entity, viewer)
                    && !entity.is_dormant
                    && Self::interval_elapsed(entity, now, self.tick_interval)
            }
            None => false,
        }
    }

    /// Entities relevant to `viewer` that are also within `max_distance`.
    /// The extra cap can narrow an entity's own radius, never widen it.
    pub fn relevant_entities(
        &self,
        registry: &EntityRegistry,
        viewer: Vec3,
        max_distance: f32,
    ) -> Vec<NetworkId> {
        registry
            .entries()
            .filter(|e| Self::in_range(e, viewer) && e.location.distance(viewer) <= max_distance)
            .map(|e| e.network_id)
            .collect()
    }

    pub(crate) fn in_range(entity: &EntityInfo, viewer: Vec3) -> bool {
        entity.location.distance(viewer) <= entity.relevancy_radius
    }

    pub(crate) fn interval_elapsed(entity: &EntityInfo, now: f64, interval: f64) -> bool {
        match entity.last_replication_time {
            Some(last) => now - last + TIME_EPSILON >= interval,
            None => true,
        }
    }
}
