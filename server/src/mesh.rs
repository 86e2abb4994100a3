//! Server meshing: spatial zones, each owned by a backend node, plus
//! the load balancing that moves entities from busy zones to quiet ones.
//!
//! Zones are kept in creation order. A location that falls inside more
//! than one zone resolves to the oldest of them.

use crate::registry::EntityRegistry;
use bincode::{deserialize, serialize};
use log::{debug, info, warn};
use shared::{
    EntityState, ErrorEvent, EventBus, MeshConfig, NetworkId, NodeId, Packet, ReplicationError,
    Vec3, ZoneConfig,
};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerMeshZone {
    pub zone_id: String,
    pub center: Vec3,
    pub radius: f32,
    pub node_id: NodeId,
    pub player_count: u32,
    pub entity_count: u32,
    /// 0..=100
    pub load: f32,
    pub is_active: bool,
}

impl ServerMeshZone {
    pub fn contains(&self, location: Vec3) -> bool {
        self.center.distance(location) <= self.radius
    }
}

/// An entity that should leave an overloaded zone
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationCandidate {
    pub network_id: NetworkId,
    pub from_zone: String,
    pub to_zone: String,
    pub target_node: NodeId,
}

/// A committed migration, ready to be announced
#[derive(Debug, Clone, PartialEq)]
pub struct EntityHandoff {
    pub network_id: NetworkId,
    pub from_zone: String,
    pub to_zone: String,
    pub target_node: NodeId,
    /// bincode-encoded `EntityState` as of the commit
    pub state: Vec<u8>,
}

impl EntityHandoff {
    pub fn decode_state(&self) -> Result<EntityState, ReplicationError> {
        Ok(deserialize(&self.state)?)
    }

    pub fn to_packet(&self) -> Packet {
        Packet::ZoneHandoff {
            network_id: self.network_id,
            from_zone: self.from_zone.clone(),
            to_zone: self.to_zone.clone(),
            target_node: self.target_node,
        }
    }
}

pub struct ServerMeshCoordinator {
    config: MeshConfig,
    zones: Vec<ServerMeshZone>,
    next_zone_index: u32,
    assignments: HashMap<NetworkId, String>,
    last_balance: Option<f64>,
    errors: EventBus<ErrorEvent>,
}

impl ServerMeshCoordinator {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            config: config.clone(),
            zones: Vec::new(),
            next_zone_index: 0,
            assignments: HashMap::new(),
            last_balance: None,
            errors: EventBus::new(),
        }
    }

    /// Builds a coordinator with one zone per `[[zones]]` entry.
    pub fn with_zones(config: &MeshConfig, zones: &[ZoneConfig]) -> Self {
        let mut coordinator = Self::new(config);
        for zone in zones {
            coordinator.create_zone(zone.center(), zone.radius, zone.node_id);
        }
        coordinator
    }

    pub fn error_events(&mut self) -> &mut EventBus<ErrorEvent> {
        &mut self.errors
    }

    pub fn create_zone(&mut self, center: Vec3, radius: f32, node_id: NodeId) -> ServerMeshZone {
        let zone = ServerMeshZone {
            zone_id: format!("Zone_{}_{}", node_id, self.next_zone_index),
            center,
            radius: radius.max(0.0),
            node_id,
            player_count: 0,
            entity_count: 0,
            load: 0.0,
            is_active: true,
        };
        self.next_zone_index += 1;

        info!(
            "Created zone {} at {} (radius {}) on node {}",
            zone.zone_id, center, zone.radius, node_id
        );
        self.zones.push(zone.clone());
        zone
    }

    /// Removes a zone and forgets which entities were assigned to it.
    pub fn remove_zone(&mut self, zone_id: &str) -> bool {
        let before = self.zones.len();
        self.zones.retain(|z| z.zone_id != zone_id);
        if self.zones.len() == before {
            return false;
        }
        self.assignments.retain(|_, zone| zone != zone_id);
        info!("Removed zone {}", zone_id);
        true
    }

    pub fn set_zone_active(&mut self, zone_id: &str, active: bool) -> bool {
        match self.zones.iter_mut().find(|z| z.zone_id == zone_id) {
            Some(zone) => {
                zone.is_active = active;
                true
            }
            None => false,
        }
    }

    pub fn zone(&self, zone_id: &str) -> Option<ServerMeshZone> {
        self.zones.iter().find(|z| z.zone_id == zone_id).cloned()
    }

    pub fn zones(&self) -> Vec<ServerMeshZone> {
        self.zones.clone()
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// First active zone, in creation order, that contains `location`.
    pub fn zone_for_location(&self, location: Vec3) -> Option<ServerMeshZone> {
        self.zones
            .iter()
            .find(|z| z.is_active && z.contains(location))
            .cloned()
    }

    /// Overwrites a zone's counters. Load is clamped to 0..=100.
    pub fn update_zone_stats(
        &mut self,
        zone_id: &str,
        player_count: u32,
        entity_count: u32,
        load: f32,
    ) -> Result<(), ReplicationError> {
        match self.zones.iter_mut().find(|z| z.zone_id == zone_id) {
            Some(zone) => {
                zone.player_count = player_count;
                zone.entity_count = entity_count;
                zone.load = load.clamp(0.0, 100.0);
                Ok(())
            }
            None => {
                let error = ReplicationError::UnknownZone(zone_id.to_string());
                warn!("Rejected zone stats update: {}", error);
                self.errors.emit(&ErrorEvent::from_error(zone_id, &error));
                Err(error)
            }
        }
    }

    /// Least loaded active zone containing `location`. Ties go to the
    /// older zone.
    pub fn find_best_zone_for_entity(&self, location: Vec3) -> Option<ServerMeshZone> {
        let mut best: Option<&ServerMeshZone> = None;
        for zone in self.zones.iter().filter(|z| z.is_active && z.contains(location)) {
            if best.map_or(true, |b| zone.load < b.load) {
                best = Some(zone);
            }
        }
        best.cloned()
    }

    /// Zone an entity was explicitly migrated to, if any.
    pub fn assigned_zone(&self, network_id: NetworkId) -> Option<String> {
        self.assignments.get(&network_id).cloned()
    }

    /// Zone an entity currently belongs to: its migration assignment if
    /// that zone still exists, otherwise the zone its location falls in.
    pub fn current_zone(&self, network_id: NetworkId, location: Vec3) -> Option<String> {
        match self.assignments.get(&network_id) {
            Some(zone_id) if self.zone_index(zone_id).is_some() => Some(zone_id.clone()),
            _ => self.zone_for_location(location).map(|z| z.zone_id),
        }
    }

    /// Drops the zone assignment of an unregistered entity.
    pub fn forget_entity(&mut self, network_id: NetworkId) {
        self.assignments.remove(&network_id);
    }

    /// Finds entities in overloaded zones that could move to a zone
    /// whose load is at least `min_load_gap` lower. Nothing is moved;
    /// see `commit_migration`.
    pub fn balance_server_load(&self, registry: &EntityRegistry) -> Vec<MigrationCandidate> {
        let mut candidates = Vec::new();

        for source in self
            .zones
            .iter()
            .filter(|z| z.is_active && z.load > self.config.overload_threshold)
        {
            let target = match self.least_loaded_target(source) {
                Some(target) => target,
                None => {
                    debug!(
                        "Zone {} is overloaded ({:.1}) but has no migration target",
                        source.zone_id, source.load
                    );
                    continue;
                }
            };

            for entity in registry.entries().filter(|e| {
                self.current_zone(e.network_id, e.location).as_deref()
                    == Some(source.zone_id.as_str())
            }) {
                info!(
                    "Migration candidate {} from {} ({:.1}) to {} ({:.1})",
                    entity.network_id, source.zone_id, source.load, target.zone_id, target.load
                );
                candidates.push(MigrationCandidate {
                    network_id: entity.network_id,
                    from_zone: source.zone_id.clone(),
                    to_zone: target.zone_id.clone(),
                    target_node: target.node_id,
                });
            }
        }

        candidates
    }

    /// Runs `balance_server_load` if the balance interval has elapsed.
    pub fn maybe_balance(
        &mut self,
        registry: &EntityRegistry,
        now: f64,
    ) -> Option<Vec<MigrationCandidate>> {
        if let Some(last) = self.last_balance {
            if now - last < self.config.balance_interval_secs {
                return None;
            }
        }
        self.last_balance = Some(now);
        Some(self.balance_server_load(registry))
    }

    /// Moves an entity from one zone to another: snapshots its state,
    /// shifts the entity counts and records the new assignment.
    ///
    /// Returns `None` if the entity is gone, no longer belongs to the
    /// source zone, either zone no longer exists, or the target has been
    /// deactivated in the meantime.
    pub fn commit_migration(
        &mut self,
        candidate: &MigrationCandidate,
        registry: &EntityRegistry,
    ) -> Option<EntityHandoff> {
        let entity = registry.get(candidate.network_id)?;
        if self.current_zone(entity.network_id, entity.location).as_deref()
            != Some(candidate.from_zone.as_str())
        {
            debug!(
                "Skipping migration of {}: no longer in {}",
                candidate.network_id, candidate.from_zone
            );
            return None;
        }
        let from = self.zone_index(&candidate.from_zone)?;
        let to = self.zone_index(&candidate.to_zone)?;
        if !self.zones[to].is_active {
            warn!(
                "Migration of {} aborted: zone {} is inactive",
                candidate.network_id, candidate.to_zone
            );
            return None;
        }

        let state = match serialize(&entity.state()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to snapshot {} for migration: {}", candidate.network_id, e);
                return None;
            }
        };

        self.zones[from].entity_count = self.zones[from].entity_count.saturating_sub(1);
        self.zones[to].entity_count += 1;
        self.assignments
            .insert(candidate.network_id, candidate.to_zone.clone());

        info!(
            "Handed off {} from {} to {} (node {})",
            candidate.network_id, candidate.from_zone, candidate.to_zone, self.zones[to].node_id
        );

        Some(EntityHandoff {
            network_id: candidate.network_id,
            from_zone: candidate.from_zone.clone(),
            to_zone: candidate.to_zone.clone(),
            target_node: self.zones[to].node_id,
            state,
        })
    }

    fn zone_index(&self, zone_id: &str) -> Option<usize> {
        self.zones.iter().position(|z| z.zone_id == zone_id)
    }

    fn least_loaded_target(&self, source: &ServerMeshZone) -> Option<&ServerMeshZone> {
        let ceiling = source.load - self.config.min_load_gap;
        let mut best: Option<&ServerMeshZone> = None;
        for zone in self
            .zones
            .iter()
            .filter(|z| z.is_active && z.zone_id != source.zone_id && z.load <= ceiling)
        {
            if best.map_or(true, |b| zone.load < b.load) {
                best = Some(zone);
            }
        }
        best
    }
}
