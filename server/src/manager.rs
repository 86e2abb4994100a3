//! Owns the replication components and runs them in the right order
//! once per network tick.

use crate::mesh::{EntityHandoff, ServerMeshCoordinator};
use crate::registry::EntityRegistry;
use crate::relevancy::RelevancyFilter;
use crate::scheduler::{ReplicationScheduler, ReplicationStats, TickReport, Viewer};
use crate::server_node::ServerNode;
use log::debug;
use shared::{
    ActorRef, ClientId, Config, EntityState, EntityType, NetworkId, ReplicationError,
    ReplicationPriority, Vec3,
};
use std::collections::{BTreeMap, HashMap};

/// Everything one tick produced that has to go out on the wire
#[derive(Debug, Default)]
pub struct TickOutput {
    pub report: TickReport,
    /// Per viewer, the entity states to send
    pub updates: BTreeMap<ClientId, Vec<EntityState>>,
    /// Entities whose actor died since the previous tick
    pub removed: Vec<NetworkId>,
    pub handoffs: Vec<EntityHandoff>,
}

pub struct ReplicationManager {
    registry: EntityRegistry,
    filter: RelevancyFilter,
    scheduler: ReplicationScheduler,
    mesh: Option<ServerMeshCoordinator>,
    node: ServerNode,
}

impl ReplicationManager {
    pub fn new(config: &Config) -> Self {
        let mesh = if config.replication.enable_server_meshing {
            Some(ServerMeshCoordinator::with_zones(&config.mesh, &config.zones))
        } else {
            None
        };

        Self {
            registry: EntityRegistry::new(&config.replication),
            filter: RelevancyFilter::new(&config.replication),
            scheduler: ReplicationScheduler::new(&config.replication),
            mesh,
            node: ServerNode::from_config(&config.mesh, Vec3::ZERO),
        }
    }

    pub fn register(
        &mut self,
        actor: Option<ActorRef>,
        entity_type: EntityType,
        priority: ReplicationPriority,
    ) -> Result<NetworkId, ReplicationError> {
        self.registry.register(actor, entity_type, priority)
    }

    pub fn unregister(&mut self, network_id: NetworkId) -> bool {
        if let Some(mesh) = self.mesh.as_mut() {
            mesh.forget_entity(network_id);
        }
        self.registry.unregister(network_id)
    }

    /// Drops a departing viewer's queued sends.
    pub fn cancel_viewer(&mut self, client_id: ClientId) -> usize {
        self.scheduler.cancel_viewer(client_id)
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut EntityRegistry {
        &mut self.registry
    }

    pub fn filter(&self) -> &RelevancyFilter {
        &self.filter
    }

    pub fn scheduler(&self) -> &ReplicationScheduler {
        &self.scheduler
    }

    pub fn mesh(&self) -> Option<&ServerMeshCoordinator> {
        self.mesh.as_ref()
    }

    pub fn mesh_mut(&mut self) -> Option<&mut ServerMeshCoordinator> {
        self.mesh.as_mut()
    }

    pub fn node(&self) -> &ServerNode {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut ServerNode {
        &mut self.node
    }

    pub fn stats(&self) -> ReplicationStats {
        self.scheduler.stats()
    }

    /// One network tick: prune, sample, schedule, balance.
    pub fn tick(&mut self, viewers: &[Viewer], now: f64) -> TickOutput {
        let removed = self.registry.prune_destroyed();
        if let Some(mesh) = self.mesh.as_mut() {
            for id in &removed {
                mesh.forget_entity(*id);
            }
        }

        self.registry.refresh_transforms();
        self.refresh_local_zones(viewers);

        let report = self.scheduler.tick(&mut self.registry, viewers, now);

        let mut handoffs = Vec::new();
        if let Some(mesh) = self.mesh.as_mut() {
            if let Some(candidates) = mesh.maybe_balance(&self.registry, now) {
                for candidate in &candidates {
                    if let Some(handoff) = mesh.commit_migration(candidate, &self.registry) {
                        handoffs.push(handoff);
                    }
                }
            }
        }

        let updates = self
            .scheduler
            .drain_outbox()
            .into_iter()
            .map(|(client_id, ids)| {
                let states = ids
                    .into_iter()
                    .filter_map(|id| self.registry.get(id).map(|e| e.state()))
                    .collect();
                (client_id, states)
            })
            .collect();

        TickOutput {
            report,
            updates,
            removed,
            handoffs,
        }
    }

    /// Recounts players and entities for the zones this node owns and
    /// stamps them with the node's load. Other nodes report their own.
    fn refresh_local_zones(&mut self, viewers: &[Viewer]) {
        let mesh = match self.mesh.as_mut() {
            Some(mesh) => mesh,
            None => return,
        };

        let mut entity_counts: HashMap<String, u32> = HashMap::new();
        for entity in self.registry.entries() {
            if let Some(zone_id) = mesh.current_zone(entity.network_id, entity.location) {
                *entity_counts.entry(zone_id).or_default() += 1;
            }
        }

        let mut player_counts: HashMap<String, u32> = HashMap::new();
        for viewer in viewers {
            if let Some(zone) = mesh.zone_for_location(viewer.location) {
                *player_counts.entry(zone.zone_id).or_default() += 1;
            }
        }

        let load = self.node.load();
        let node_id = self.node.server_id();
        for zone in mesh.zones().into_iter().filter(|z| z.node_id == node_id) {
            let players = player_counts.get(&zone.zone_id).copied().unwrap_or(0);
            let entities = entity_counts.get(&zone.zone_id).copied().unwrap_or(0);
            if let Err(e) = mesh.update_zone_stats(&zone.zone_id, players, entities, load) {
                debug!("Skipping stats for zone {}: {}", zone.zone_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ProxyActor;

    fn config() -> Config {
        Config::default()
    }

    fn viewer(client_id: ClientId, x: f32) -> Viewer {
        Viewer {
            client_id,
            location: Vec3::new(x, 0.0, 0.0),
        }
    }

    #[test]
    fn test_player_projectile_effect_scenario() {
        let mut manager = ReplicationManager::new(&config());

        let player = manager
            .register(
                Some(ProxyActor::shared(1, Vec3::ZERO)),
                EntityType::Player,
                ReplicationPriority::Normal,
            )
            .unwrap();
        let projectile = manager
            .register(
                Some(ProxyActor::shared(2, Vec3::new(5_000.0, 0.0, 0.0))),
                EntityType::Projectile,
                ReplicationPriority::High,
            )
            .unwrap();
        let effect = manager
            .register(
                Some(ProxyActor::shared(3, Vec3::new(50_000.0, 0.0, 0.0))),
                EntityType::Effect,
                ReplicationPriority::Low,
            )
            .unwrap();

        let output = manager.tick(&[viewer(1, 0.0)], 0.0);

        assert!(output.report.replicated.contains(&player));
        assert!(output.report.replicated.contains(&projectile));
        assert!(!output.report.replicated.contains(&effect));

        let sent: Vec<NetworkId> = output.updates[&1].iter().map(|s| s.network_id).collect();
        assert_eq!(sent.len(), 2);
        assert!(!sent.contains(&effect));
    }

    #[test]
    fn test_destroyed_actor_is_reported_once() {
        let mut manager = ReplicationManager::new(&config());
        let actor = ProxyActor::shared(1, Vec3::ZERO);
        let id = manager
            .register(
                Some(actor.clone()),
                EntityType::Npc,
                ReplicationPriority::Normal,
            )
            .unwrap();

        actor.destroy();
        let first = manager.tick(&[viewer(1, 0.0)], 0.0);
        assert_eq!(first.removed, vec![id]);
        assert!(first.report.replicated.is_empty());

        let second = manager.tick(&[viewer(1, 0.0)], 1.0);
        assert!(second.removed.is_empty());
    }

    #[test]
    fn test_moving_actor_is_sampled_each_tick() {
        let mut manager = ReplicationManager::new(&config());
        let actor = ProxyActor::shared(1, Vec3::ZERO);
        manager
            .register(
                Some(actor.clone()),
                EntityType::PlayerShip,
                ReplicationPriority::High,
            )
            .unwrap();

        manager.tick(&[viewer(1, 0.0)], 0.0);
        actor.set_location(Vec3::new(250.0, 0.0, 0.0));
        let output = manager.tick(&[viewer(1, 0.0)], 1.0);

        assert_eq!(output.updates[&1][0].location, Vec3::new(250.0, 0.0, 0.0));
    }

    #[test]
    fn test_balance_runs_and_produces_handoffs() {
        let mut config = config();
        config.mesh.node_id = 1;
        config.mesh.max_players = 1;
        let mut manager = ReplicationManager::new(&config);

        let mesh = manager.mesh_mut().unwrap();
        mesh.create_zone(Vec3::ZERO, 1_000.0, 1);
        let remote = mesh.create_zone(Vec3::new(10_000.0, 0.0, 0.0), 1_000.0, 2);

        let id = manager
            .register(
                Some(ProxyActor::shared(1, Vec3::ZERO)),
                EntityType::Npc,
                ReplicationPriority::Normal,
            )
            .unwrap();

        // One full player slot plus maxed resources puts the node at 100
        manager.node_mut().add_player(1);
        manager.node_mut().update_metrics(100.0, 100.0, 100.0);

        let output = manager.tick(&[viewer(1, 0.0)], 0.0);
        assert_eq!(output.handoffs.len(), 1);
        assert_eq!(output.handoffs[0].network_id, id);
        assert_eq!(output.handoffs[0].to_zone, remote.zone_id);

        // Next balance only after the interval
        let output = manager.tick(&[viewer(1, 0.0)], 1.0);
        assert!(output.handoffs.is_empty());
    }

    #[test]
    fn test_each_entity_is_handed_off_once() {
        let mut config = config();
        config.mesh.node_id = 1;
        config.mesh.max_players = 1;
        let mut manager = ReplicationManager::new(&config);

        let mesh = manager.mesh_mut().unwrap();
        let local = mesh.create_zone(Vec3::ZERO, 1_000.0, 1);
        let remote = mesh.create_zone(Vec3::new(10_000.0, 0.0, 0.0), 1_000.0, 2);

        manager
            .register(
                Some(ProxyActor::shared(1, Vec3::ZERO)),
                EntityType::Npc,
                ReplicationPriority::Normal,
            )
            .unwrap();
        manager.node_mut().add_player(1);
        manager.node_mut().update_metrics(100.0, 100.0, 100.0);

        // Balancing is due on every one of these ticks
        let handoffs: usize = [0.0, 30.0, 60.0, 90.0]
            .iter()
            .map(|&now| manager.tick(&[viewer(1, 0.0)], now).handoffs.len())
            .sum();
        assert_eq!(handoffs, 1);

        let mesh = manager.mesh().unwrap();
        assert_eq!(mesh.zone(&remote.zone_id).unwrap().entity_count, 1);
        assert_eq!(mesh.zone(&local.zone_id).unwrap().entity_count, 0);
    }

    #[test]
    fn test_meshing_disabled() {
        let mut config = config();
        config.replication.enable_server_meshing = false;
        let manager = ReplicationManager::new(&config);
        assert!(manager.mesh().is_none());
    }
}
