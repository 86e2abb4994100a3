//! Registry of every entity the server replicates.
//!
//! The registry is the sole owner of entity metadata. Other components
//! read it through `info()` copies or crate-internal iteration during
//! the tick, and mutate it only through the methods below.

use log::{debug, warn};
use shared::{
    ActorId, ActorRef, EntityState, EntityType, ErrorEvent, EventBus, NetworkId,
    ReplicationConfig, ReplicationError, ReplicationPriority, Rotator, Vec3,
};
use std::collections::{BTreeMap, HashMap};

/// Snapshot of a registered entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInfo {
    pub network_id: NetworkId,
    pub actor_id: ActorId,
    pub entity_type: EntityType,
    pub priority: ReplicationPriority,
    pub relevancy_radius: f32,
    /// Transform sampled from the actor at the start of the tick
    pub location: Vec3,
    pub rotation: Rotator,
    pub velocity: Vec3,
    pub last_replicated_location: Vec3,
    pub last_replicated_rotation: Rotator,
    pub last_replicated_velocity: Vec3,
    /// Core clock time of the last send; `None` means due immediately
    pub last_replication_time: Option<f64>,
    pub is_dormant: bool,
    /// Dormant because the bandwidth throttle put it to sleep, as
    /// opposed to an explicit `set_dormancy` call
    pub throttled: bool,
}

impl EntityInfo {
    pub fn state(&self) -> EntityState {
        EntityState {
            network_id: self.network_id,
            entity_type: self.entity_type,
            location: self.location,
            rotation: self.rotation,
            velocity: self.velocity,
        }
    }
}

struct Entry {
    info: EntityInfo,
    actor: ActorRef,
}

pub struct EntityRegistry {
    entities: BTreeMap<NetworkId, Entry>,
    by_actor: HashMap<ActorId, NetworkId>,
    next_id: u32,
    config: ReplicationConfig,
    errors: EventBus<ErrorEvent>,
}

impl EntityRegistry {
    /// Creates an empty registry
    ///
    /// Default relevancy radii per entity type come from `config`.
    /// Network IDs start at 1; 0 is reserved as the null ID.
    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            entities: BTreeMap::new(),
            by_actor: HashMap::new(),
            next_id: 1,
            config: config.clone(),
            errors: EventBus::new(),
        }
    }

    /// Observers of invalid-input failures
    pub fn error_events(&mut self) -> &mut EventBus<ErrorEvent> {
        &mut self.errors
    }

    /// Registers an actor for replication.
    ///
    /// An actor that is already registered keeps its ID; the type and
    /// priority of the existing record are left untouched.
    pub fn register(
        &mut self,
        actor: Option<ActorRef>,
        entity_type: EntityType,
        priority: ReplicationPriority,
    ) -> Result<NetworkId, ReplicationError> {
        let actor = match actor {
            Some(actor) => actor,
            None => {
                let error = ReplicationError::InvalidActor;
                warn!("Rejected registration: {}", error);
                self.errors
                    .emit(&ErrorEvent::from_error(NetworkId::NULL.to_string(), &error));
                return Err(error);
            }
        };

        let actor_id = actor.actor_id();
        if let Some(existing) = self.by_actor.get(&actor_id) {
            debug!("Actor {} already registered as {}", actor_id, existing);
            return Ok(*existing);
        }

        let network_id = NetworkId(self.next_id);
        self.next_id += 1;

        let location = actor.location();
        let rotation = actor.rotation();
        let velocity = actor.velocity();
        let info = EntityInfo {
            network_id,
            actor_id,
            entity_type,
            priority,
            relevancy_radius: self.config.relevancy_radius_for(entity_type),
            location,
            rotation,
            velocity,
            last_replicated_location: location,
            last_replicated_rotation: rotation,
            last_replicated_velocity: velocity,
            last_replication_time: None,
            is_dormant: false,
            throttled: false,
        };

        debug!(
            "Registered {:?} {} ({:?}, radius {})",
            entity_type, network_id, priority, info.relevancy_radius
        );
        self.entities.insert(network_id, Entry { info, actor });
        self.by_actor.insert(actor_id, network_id);

        Ok(network_id)
    }

    /// Removes an entity from replication
    ///
    /// Returns false for unknown IDs. The ID is never handed out again
    /// while this registry lives.
    pub fn unregister(&mut self, network_id: NetworkId) -> bool {
        match self.entities.remove(&network_id) {
            Some(entry) => {
                self.by_actor.remove(&entry.info.actor_id);
                debug!("Unregistered {}", network_id);
                true
            }
            None => false,
        }
    }

    /// Changes how often an entity may be replicated
    ///
    /// Takes effect from the next tick. Unknown IDs are ignored.
    pub fn set_priority(&mut self, network_id: NetworkId, priority: ReplicationPriority) {
        if let Some(entry) = self.entities.get_mut(&network_id) {
            entry.info.priority = priority;
        }
    }

    /// Puts an entity to sleep or wakes it up
    ///
    /// Dormant entities are skipped by the scheduler regardless of
    /// relevancy. Explicit dormancy overrides any throttle-induced
    /// sleep, so the throttle will not wake an entity put to sleep here.
    pub fn set_dormancy(&mut self, network_id: NetworkId, dormant: bool) {
        if let Some(entry) = self.entities.get_mut(&network_id) {
            entry.info.is_dormant = dormant;
            entry.info.throttled = false;
        }
    }

    /// Overrides the type-based relevancy radius of one entity
    ///
    /// Negative radii are clamped to zero, which makes the entity
    /// relevant only to viewers standing exactly on it.
    pub fn set_relevancy_radius(&mut self, network_id: NetworkId, radius: f32) {
        if let Some(entry) = self.entities.get_mut(&network_id) {
            entry.info.relevancy_radius = radius.max(0.0);
        }
    }

    /// Makes an entity eligible on the next tick
    ///
    /// Clears the last replication time so the priority interval no
    /// longer holds it back. Dormancy still applies.
    pub fn force_replication(&mut self, network_id: NetworkId) {
        if let Some(entry) = self.entities.get_mut(&network_id) {
            entry.info.last_replication_time = None;
        }
    }

    /// Copy of an entity's metadata
    pub fn info(&self, network_id: NetworkId) -> Option<EntityInfo> {
        self.entities.get(&network_id).map(|e| e.info.clone())
    }

    /// Network ID an actor was registered under
    pub fn find_by_actor(&self, actor_id: ActorId) -> Option<NetworkId> {
        self.by_actor.get(&actor_id).copied()
    }

    pub fn contains(&self, network_id: NetworkId) -> bool {
        self.entities.contains_key(&network_id)
    }

    /// All registered IDs in ascending order
    pub fn ids(&self) -> Vec<NetworkId> {
        self.entities.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Samples every actor's current transform.
    pub fn refresh_transforms(&mut self) {
        for entry in self.entities.values_mut() {
            entry.info.location = entry.actor.location();
            entry.info.rotation = entry.actor.rotation();
            entry.info.velocity = entry.actor.velocity();
        }
    }

    /// Unregisters entities whose actor has been destroyed and returns
    /// their IDs so callers can tell clients.
    pub fn prune_destroyed(&mut self) -> Vec<NetworkId> {
        let dead: Vec<NetworkId> = self
            .entities
            .values()
            .filter(|e| !e.actor.is_alive())
            .map(|e| e.info.network_id)
            .collect();

        for id in &dead {
            self.unregister(*id);
        }
        dead
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &EntityInfo> {
        self.entities.values().map(|e| &e.info)
    }

    pub(crate) fn get(&self, network_id: NetworkId) -> Option<&EntityInfo> {
        self.entities.get(&network_id).map(|e| &e.info)
    }

    /// Records a send: the current transform becomes the last
    /// replicated one.
    pub(crate) fn mark_replicated(&mut self, network_id: NetworkId, now: f64) {
        if let Some(entry) = self.entities.get_mut(&network_id) {
            let info = &mut entry.info;
            info.last_replicated_location = info.location;
            info.last_replicated_rotation = info.rotation;
            info.last_replicated_velocity = info.velocity;
            info.last_replication_time = Some(now);
        }
    }

    /// Throttle-driven dormancy. Waking only touches entities the
    /// throttle itself put to sleep.
    pub(crate) fn set_throttled(&mut self, network_id: NetworkId, throttled: bool) {
        if let Some(entry) = self.entities.get_mut(&network_id) {
            let info = &mut entry.info;
            if throttled && !info.is_dormant {
                info.is_dormant = true;
                info.throttled = true;
            } else if !throttled && info.throttled {
                info.is_dormant = false;
                info.throttled = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ProxyActor;
    use std::sync::{Arc, Mutex};

    fn actor(id: u64, x: f32) -> ActorRef {
        ProxyActor::shared(id, Vec3::new(x, 0.0, 0.0))
    }

    fn registry() -> EntityRegistry {
        EntityRegistry::new(&ReplicationConfig::default())
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let mut registry = registry();
        let mut previous = NetworkId::NULL;

        for i in 0..50 {
            let id = registry
                .register(Some(actor(i, 0.0)), EntityType::Asteroid, ReplicationPriority::Low)
                .unwrap();
            assert!(id > previous);
            previous = id;
        }
        assert_eq!(registry.len(), 50);
    }

    #[test]
    fn test_ids_not_reused_after_unregister() {
        let mut registry = registry();
        let a = registry
            .register(Some(actor(1, 0.0)), EntityType::Npc, ReplicationPriority::Normal)
            .unwrap();
        assert!(registry.unregister(a));

        let b = registry
            .register(Some(actor(2, 0.0)), EntityType::Npc, ReplicationPriority::Normal)
            .unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_missing_actor_fails_with_error_event() {
        let mut registry = registry();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        registry
            .error_events()
            .subscribe(move |e: &ErrorEvent| sink.lock().unwrap().push(e.clone()));

        let result = registry.register(None, EntityType::Npc, ReplicationPriority::Normal);
        assert!(matches!(result, Err(ReplicationError::InvalidActor)));
        assert!(registry.is_empty());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject, NetworkId::NULL.to_string());
    }

    #[test]
    fn test_duplicate_actor_returns_existing_id() {
        let mut registry = registry();
        let ship = actor(10, 0.0);

        let first = registry
            .register(Some(Arc::clone(&ship)), EntityType::PlayerShip, ReplicationPriority::High)
            .unwrap();
        let second = registry
            .register(Some(ship), EntityType::PlayerShip, ReplicationPriority::High)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_by_actor(10), Some(first));
    }

    #[test]
    fn test_default_radius_from_type() {
        let mut registry = registry();
        let station = registry
            .register(Some(actor(1, 0.0)), EntityType::Station, ReplicationPriority::Normal)
            .unwrap();
        let effect = registry
            .register(Some(actor(2, 0.0)), EntityType::Effect, ReplicationPriority::Normal)
            .unwrap();

        assert_eq!(registry.info(station).unwrap().relevancy_radius, 500_000.0);
        assert_eq!(registry.info(effect).unwrap().relevancy_radius, 10_000.0);
    }

    #[test]
    fn test_unknown_ids_are_noops() {
        let mut registry = registry();
        let ghost = NetworkId(99);

        assert!(!registry.unregister(ghost));
        registry.set_priority(ghost, ReplicationPriority::Critical);
        registry.set_dormancy(ghost, true);
        registry.force_replication(ghost);
        assert!(registry.info(ghost).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_force_replication_clears_time() {
        let mut registry = registry();
        let id = registry
            .register(Some(actor(1, 0.0)), EntityType::Npc, ReplicationPriority::Normal)
            .unwrap();

        registry.mark_replicated(id, 4.0);
        assert_eq!(registry.info(id).unwrap().last_replication_time, Some(4.0));

        registry.force_replication(id);
        assert_eq!(registry.info(id).unwrap().last_replication_time, None);
    }

    #[test]
    fn test_refresh_and_mark_replicated() {
        let mut registry = registry();
        let ship = ProxyActor::shared(1, Vec3::ZERO);
        let id = registry
            .register(
                Some(ship.clone() as ActorRef),
                EntityType::PlayerShip,
                ReplicationPriority::High,
            )
            .unwrap();

        ship.set_location(Vec3::new(500.0, 0.0, 0.0));
        registry.refresh_transforms();

        let info = registry.info(id).unwrap();
        assert_eq!(info.location, Vec3::new(500.0, 0.0, 0.0));
        assert_eq!(info.last_replicated_location, Vec3::ZERO);

        registry.mark_replicated(id, 1.0);
        let info = registry.info(id).unwrap();
        assert_eq!(info.last_replicated_location, Vec3::new(500.0, 0.0, 0.0));
    }

    #[test]
    fn test_prune_destroyed() {
        let mut registry = registry();
        let doomed = ProxyActor::shared(1, Vec3::ZERO);
        let doomed_id = registry
            .register(Some(doomed.clone() as ActorRef), EntityType::Npc, ReplicationPriority::Normal)
            .unwrap();
        let survivor = registry
            .register(Some(actor(2, 0.0)), EntityType::Npc, ReplicationPriority::Normal)
            .unwrap();

        doomed.destroy();
        assert_eq!(registry.prune_destroyed(), vec![doomed_id]);
        assert!(!registry.contains(doomed_id));
        assert!(registry.contains(survivor));
        assert_eq!(registry.find_by_actor(1), None);
    }

    #[test]
    fn test_throttle_does_not_wake_manual_dormancy() {
        let mut registry = registry();
        let id = registry
            .register(Some(actor(1, 0.0)), EntityType::Pickup, ReplicationPriority::Low)
            .unwrap();

        registry.set_dormancy(id, true);
        registry.set_throttled(id, true);
        registry.set_throttled(id, false);
        assert!(registry.info(id).unwrap().is_dormant);

        registry.set_dormancy(id, false);
        registry.set_throttled(id, true);
        assert!(registry.info(id).unwrap().throttled);
        registry.set_throttled(id, false);
        assert!(!registry.info(id).unwrap().is_dormant);
    }
}
