//! Per-tick replication scheduling under a bandwidth budget.
//!
//! Each tick the scheduler picks the entities that are due, relevant to
//! at least one viewer and awake, ranks them by priority score, and
//! sends as many as the byte budget and the per-frame cap allow. What
//! was sent is queued per viewer in an outbox the network layer drains.
//!
//! When the leftover budget gets thin the scheduler puts low-priority
//! entities to sleep, and wakes them once there is room again. The two
//! thresholds form a hysteresis band so the throttle does not flap.

use crate::registry::{EntityInfo, EntityRegistry};
use crate::relevancy::RelevancyFilter;
use log::{debug, info};
use shared::{ClientId, NetworkId, ReplicationConfig, ReplicationPriority, Vec3};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A client's point of view for this tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewer {
    pub client_id: ClientId,
    pub location: Vec3,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationStats {
    pub ticks: u64,
    pub total_entities_replicated: u64,
    pub total_bytes_sent: u64,
    pub last_tick_candidates: usize,
    pub last_tick_entities: usize,
    pub last_tick_bytes: u64,
    pub throttled: bool,
    pub throttle_activations: u64,
}

impl ReplicationStats {
    pub fn average_bytes_per_tick(&self) -> f64 {
        if self.ticks == 0 {
            0.0
        } else {
            self.total_bytes_sent as f64 / self.ticks as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Entities sent this tick, highest score first
    pub replicated: Vec<NetworkId>,
    pub bytes_used: u64,
    pub budget_bytes: u64,
    pub throttle_engaged: bool,
    pub throttle_released: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    network_id: NetworkId,
    score: f32,
    /// Throttled entity whose starvation floor is due; goes first
    starving: bool,
}

pub struct ReplicationScheduler {
    config: ReplicationConfig,
    budget_bytes: u64,
    bytes_used: u64,
    throttled: bool,
    stats: ReplicationStats,
    outbox: BTreeMap<ClientId, Vec<NetworkId>>,
}

impl ReplicationScheduler {
    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            config: config.clone(),
            budget_bytes: config.tick_budget_bytes(),
            bytes_used: 0,
            throttled: false,
            stats: ReplicationStats::default(),
            outbox: BTreeMap::new(),
        }
    }

    /// Shortest time between two sends of an entity at `priority`.
    pub fn min_interval(&self, priority: ReplicationPriority) -> f64 {
        self.config.tick_interval() / priority.multiplier() as f64
    }

    /// Frequency gate: has enough time passed for this entity's priority.
    ///
    /// Entities the throttle put to sleep pass here once the starvation
    /// floor has elapsed, and are then sent ahead of everything else.
    /// Other dormant entities never pass.
    pub fn should_replicate_this_frame(&self, entity: &EntityInfo, now: f64) -> bool {
        if entity.is_dormant {
            return entity.throttled && self.starvation_floor_due(entity, now);
        }
        RelevancyFilter::interval_elapsed(entity, now, self.min_interval(entity.priority))
    }

    /// `multiplier x (1 - distance/radius) x type weight`
    pub fn priority_score(entity: &EntityInfo, distance: f32) -> f32 {
        let distance_factor = if entity.relevancy_radius > 0.0 {
            1.0 - (distance / entity.relevancy_radius).clamp(0.0, 1.0)
        } else if distance <= 0.0 {
            1.0
        } else {
            0.0
        };
        entity.priority.multiplier() * distance_factor * entity.entity_type.type_weight()
    }

    /// Fraction of this tick's byte budget still unspent, 0..=1.
    pub fn replication_budget(&self) -> f32 {
        if self.budget_bytes == 0 {
            return 0.0;
        }
        let used = self.bytes_used.min(self.budget_bytes) as f32;
        1.0 - used / self.budget_bytes as f32
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    pub fn stats(&self) -> ReplicationStats {
        self.stats.clone()
    }

    /// Runs one scheduling pass. `now` is core clock time in seconds.
    pub fn tick(
        &mut self,
        registry: &mut EntityRegistry,
        viewers: &[Viewer],
        now: f64,
    ) -> TickReport {
        self.bytes_used = 0;

        let mut candidates = self.collect_candidates(registry, viewers, now);
        candidates.sort_by(|a, b| {
            b.starving
                .cmp(&a.starving)
                .then(b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
                .then(a.network_id.cmp(&b.network_id))
        });

        let cost = self.config.entity_cost_bytes as u64;
        let mut replicated = Vec::new();

        for candidate in &candidates {
            if self.bytes_used + cost > self.budget_bytes
                || replicated.len() >= self.config.max_entities_per_frame
            {
                break;
            }

            let (location, radius) = match registry.get(candidate.network_id) {
                Some(entity) => (entity.location, entity.relevancy_radius),
                None => continue,
            };

            registry.mark_replicated(candidate.network_id, now);
            self.bytes_used += cost;
            replicated.push(candidate.network_id);

            for viewer in viewers {
                if location.distance(viewer.location) <= radius {
                    self.outbox
                        .entry(viewer.client_id)
                        .or_default()
                        .push(candidate.network_id);
                }
            }
        }

        self.stats.ticks += 1;
        self.stats.last_tick_candidates = candidates.len();
        self.stats.last_tick_entities = replicated.len();
        self.stats.last_tick_bytes = self.bytes_used;
        self.stats.total_entities_replicated += replicated.len() as u64;
        self.stats.total_bytes_sent += self.bytes_used;

        let (throttle_engaged, throttle_released) = self.optimize_for_bandwidth(registry);

        TickReport {
            replicated,
            bytes_used: self.bytes_used,
            budget_bytes: self.budget_bytes,
            throttle_engaged,
            throttle_released,
        }
    }

    /// Takes everything queued for sending since the last drain.
    pub fn drain_outbox(&mut self) -> BTreeMap<ClientId, Vec<NetworkId>> {
        std::mem::take(&mut self.outbox)
    }

    /// Drops whatever is still queued for a departing viewer. Other
    /// viewers' queues are untouched. Returns the number of dropped sends.
    pub fn cancel_viewer(&mut self, client_id: ClientId) -> usize {
        self.outbox.remove(&client_id).map_or(0, |queued| queued.len())
    }

    fn collect_candidates(
        &self,
        registry: &EntityRegistry,
        viewers: &[Viewer],
        now: f64,
    ) -> Vec<Candidate> {
        registry
            .entries()
            .filter(|entity| self.should_replicate_this_frame(entity, now))
            .filter_map(|entity| {
                let nearest = viewers
                    .iter()
                    .filter(|v| RelevancyFilter::in_range(entity, v.location))
                    .map(|v| entity.location.distance(v.location))
                    .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))?;

                Some(Candidate {
                    network_id: entity.network_id,
                    score: Self::priority_score(entity, nearest),
                    starving: entity.is_dormant,
                })
            })
            .collect()
    }

    fn starvation_floor_due(&self, entity: &EntityInfo, now: f64) -> bool {
        match self.config.starvation_floor_secs {
            Some(floor) => RelevancyFilter::interval_elapsed(entity, now, floor),
            None => false,
        }
    }

    /// Engages or releases the low-priority throttle based on how much of
    /// this tick's budget is left.
    fn optimize_for_bandwidth(&mut self, registry: &mut EntityRegistry) -> (bool, bool) {
        let remaining = self.replication_budget();
        let mut engaged = false;
        let mut released = false;

        if !self.throttled && remaining < self.config.throttle_engage_fraction {
            self.throttled = true;
            self.stats.throttle_activations += 1;
            engaged = true;
            info!(
                "Bandwidth throttle engaged ({:.0}% budget left), sleeping low priorities",
                remaining * 100.0
            );
        } else if self.throttled && remaining > self.config.throttle_release_fraction {
            self.throttled = false;
            released = true;
            info!(
                "Bandwidth throttle released ({:.0}% budget left)",
                remaining * 100.0
            );
        }

        let updates: Vec<(NetworkId, bool)> = registry
            .entries()
            .filter_map(|e| {
                let sleep = self.throttled && e.priority.is_throttleable();
                if sleep && !e.is_dormant {
                    Some((e.network_id, true))
                } else if !sleep && e.throttled {
                    Some((e.network_id, false))
                } else {
                    None
                }
            })
            .collect();

        if !updates.is_empty() {
            debug!("Throttle changed dormancy of {} entities", updates.len());
        }
        for (id, sleep) in updates {
            registry.set_throttled(id, sleep);
        }

        self.stats.throttled = self.throttled;
        (engaged, released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ActorRef, EntityType, ProxyActor};

    fn add(
        registry: &mut EntityRegistry,
        id: u64,
        location: Vec3,
        entity_type: EntityType,
        priority: ReplicationPriority,
    ) -> NetworkId {
        let actor: ActorRef = ProxyActor::shared(id, location);
        registry.register(Some(actor), entity_type, priority).unwrap()
    }

    fn origin_viewer() -> Vec<Viewer> {
        vec![Viewer {
            client_id: 1,
            location: Vec3::ZERO,
        }]
    }

    #[test]
    fn test_scenario_out_of_range_effect_not_sent() {
        let config = ReplicationConfig::default();
        let mut registry = EntityRegistry::new(&config);
        let mut scheduler = ReplicationScheduler::new(&config);

        let player = add(
            &mut registry,
            1,
            Vec3::ZERO,
            EntityType::Player,
            ReplicationPriority::Normal,
        );
        let projectile = add(
            &mut registry,
            2,
            Vec3::new(5_000.0, 0.0, 0.0),
            EntityType::Projectile,
            ReplicationPriority::High,
        );
        let effect = add(
            &mut registry,
            3,
            Vec3::new(50_000.0, 0.0, 0.0),
            EntityType::Effect,
            ReplicationPriority::Low,
        );

        let report = scheduler.tick(&mut registry, &origin_viewer(), 0.0);

        assert_eq!(report.replicated, vec![player, projectile]);
        assert!(!report.replicated.contains(&effect));
        assert_eq!(report.bytes_used, 96);

        let outbox = scheduler.drain_outbox();
        assert_eq!(outbox.get(&1), Some(&vec![player, projectile]));
        assert!(scheduler.drain_outbox().is_empty());
    }

    #[test]
    fn test_budget_never_exceeded() {
        let config = ReplicationConfig {
            bandwidth_limit_bytes_per_sec: 48 * 10 * 30 + 47 * 30,
            max_entities_per_frame: 1_000,
            ..ReplicationConfig::default()
        };
        let mut registry = EntityRegistry::new(&config);
        let mut scheduler = ReplicationScheduler::new(&config);

        for i in 0..40 {
            add(
                &mut registry,
                i,
                Vec3::new(i as f32 * 10.0, 0.0, 0.0),
                EntityType::Npc,
                ReplicationPriority::Normal,
            );
        }

        for tick in 0..5 {
            let report = scheduler.tick(&mut registry, &origin_viewer(), tick as f64 / 30.0);
            assert!(report.bytes_used <= report.budget_bytes);
            assert_eq!(report.replicated.len(), 10);
        }
    }

    #[test]
    fn test_max_entities_per_frame_cap() {
        let config = ReplicationConfig {
            max_entities_per_frame: 3,
            ..ReplicationConfig::default()
        };
        let mut registry = EntityRegistry::new(&config);
        let mut scheduler = ReplicationScheduler::new(&config);

        for i in 0..10 {
            add(
                &mut registry,
                i,
                Vec3::ZERO,
                EntityType::Asteroid,
                ReplicationPriority::Normal,
            );
        }

        let report = scheduler.tick(&mut registry, &origin_viewer(), 0.0);
        assert_eq!(report.replicated.len(), 3);
        // equal scores fall back to id order
        assert_eq!(
            report.replicated,
            vec![NetworkId(1), NetworkId(2), NetworkId(3)]
        );
    }

    #[test]
    fn test_priority_monotonic_interval() {
        let scheduler = ReplicationScheduler::new(&ReplicationConfig::default());
        for pair in ReplicationPriority::ALL.windows(2) {
            assert!(scheduler.min_interval(pair[1]) <= scheduler.min_interval(pair[0]));
        }
    }

    #[test]
    fn test_very_low_priority_sends_every_other_tick() {
        let config = ReplicationConfig::default();
        let mut registry = EntityRegistry::new(&config);
        let mut scheduler = ReplicationScheduler::new(&config);
        let rock = add(
            &mut registry,
            1,
            Vec3::new(10.0, 0.0, 0.0),
            EntityType::Asteroid,
            ReplicationPriority::VeryLow,
        );

        let sent: Vec<bool> = (0..6)
            .map(|tick| {
                let report =
                    scheduler.tick(&mut registry, &origin_viewer(), tick as f64 / 30.0);
                report.replicated.contains(&rock)
            })
            .collect();

        assert_eq!(sent, vec![true, false, true, false, true, false]);
    }

    #[test]
    fn test_closer_and_heavier_entities_rank_first() {
        let config = ReplicationConfig::default();
        let mut registry = EntityRegistry::new(&config);
        let mut scheduler = ReplicationScheduler::new(&config);

        let far_npc = add(
            &mut registry,
            1,
            Vec3::new(40_000.0, 0.0, 0.0),
            EntityType::Npc,
            ReplicationPriority::Normal,
        );
        let near_npc = add(
            &mut registry,
            2,
            Vec3::new(1_000.0, 0.0, 0.0),
            EntityType::Npc,
            ReplicationPriority::Normal,
        );
        let ship = add(
            &mut registry,
            3,
            Vec3::new(1_000.0, 0.0, 0.0),
            EntityType::PlayerShip,
            ReplicationPriority::Normal,
        );

        let report = scheduler.tick(&mut registry, &origin_viewer(), 0.0);
        assert_eq!(report.replicated, vec![ship, near_npc, far_npc]);
    }

    #[test]
    fn test_no_viewers_nothing_sent() {
        let config = ReplicationConfig::default();
        let mut registry = EntityRegistry::new(&config);
        let mut scheduler = ReplicationScheduler::new(&config);
        add(
            &mut registry,
            1,
            Vec3::ZERO,
            EntityType::Station,
            ReplicationPriority::Critical,
        );

        let report = scheduler.tick(&mut registry, &[], 0.0);
        assert!(report.replicated.is_empty());
        assert_eq!(scheduler.replication_budget(), 1.0);
    }

    #[test]
    fn test_throttle_hysteresis() {
        // Budget fits exactly 5 entities per tick.
        let config = ReplicationConfig {
            bandwidth_limit_bytes_per_sec: 48 * 5 * 30,
            starvation_floor_secs: None,
            ..ReplicationConfig::default()
        };
        let mut registry = EntityRegistry::new(&config);
        let mut scheduler = ReplicationScheduler::new(&config);

        let mut low = Vec::new();
        for i in 0..3 {
            low.push(add(
                &mut registry,
                i,
                Vec3::new(100.0, 0.0, 0.0),
                EntityType::Pickup,
                ReplicationPriority::Low,
            ));
        }
        let ships: Vec<NetworkId> = (10..12)
            .map(|i| {
                add(
                    &mut registry,
                    i,
                    Vec3::ZERO,
                    EntityType::PlayerShip,
                    ReplicationPriority::High,
                )
            })
            .collect();

        // Everything fits and the budget is spent: throttle engages.
        let report = scheduler.tick(&mut registry, &origin_viewer(), 0.0);
        assert_eq!(report.replicated.len(), 5);
        assert!(report.throttle_engaged);
        assert!(scheduler.is_throttled());
        for id in &low {
            let info = registry.info(*id).unwrap();
            assert!(info.is_dormant && info.throttled);
        }

        // Only the ships go out, 60% left sits inside the band.
        let report = scheduler.tick(&mut registry, &origin_viewer(), 1.0 / 30.0);
        assert_eq!(report.replicated, ships);
        assert!(!report.throttle_released);
        assert!(scheduler.is_throttled());

        // Nothing sent, 100% left: throttle releases and wakes the pickups.
        for ship in &ships {
            registry.set_dormancy(*ship, true);
        }
        let report = scheduler.tick(&mut registry, &origin_viewer(), 2.0 / 30.0);
        assert!(report.replicated.is_empty());
        assert!(report.throttle_released);
        assert!(!scheduler.is_throttled());
        for id in &low {
            assert!(!registry.info(*id).unwrap().is_dormant);
        }
        // explicit dormancy survives the release
        for ship in &ships {
            assert!(registry.info(*ship).unwrap().is_dormant);
        }
    }

    #[test]
    fn test_starvation_floor_services_throttled_entities() {
        let config = ReplicationConfig {
            bandwidth_limit_bytes_per_sec: 48 * 2 * 30,
            starvation_floor_secs: Some(1.0),
            ..ReplicationConfig::default()
        };
        let mut registry = EntityRegistry::new(&config);
        let mut scheduler = ReplicationScheduler::new(&config);

        let pickup = add(
            &mut registry,
            1,
            Vec3::new(10.0, 0.0, 0.0),
            EntityType::Pickup,
            ReplicationPriority::Low,
        );
        let ship_a = add(
            &mut registry,
            2,
            Vec3::ZERO,
            EntityType::PlayerShip,
            ReplicationPriority::High,
        );
        let ship_b = add(
            &mut registry,
            3,
            Vec3::ZERO,
            EntityType::PlayerShip,
            ReplicationPriority::High,
        );

        // Two ships fill the budget every tick, which keeps the throttle on.
        let report = scheduler.tick(&mut registry, &origin_viewer(), 0.0);
        assert_eq!(report.replicated, vec![ship_a, ship_b]);
        assert!(scheduler.is_throttled());
        assert!(registry.info(pickup).unwrap().is_dormant);

        let mut pickup_sends = 0;
        for tick in 1..=60 {
            let report = scheduler.tick(&mut registry, &origin_viewer(), tick as f64 / 30.0);
            assert!(report.bytes_used <= report.budget_bytes);
            if report.replicated.contains(&pickup) {
                pickup_sends += 1;
            }
        }
        assert!(scheduler.is_throttled());
        assert!(pickup_sends >= 1, "throttled entity was starved");
    }

    #[test]
    fn test_cancel_viewer_only_drops_that_viewer() {
        let config = ReplicationConfig::default();
        let mut registry = EntityRegistry::new(&config);
        let mut scheduler = ReplicationScheduler::new(&config);

        let near_a = add(
            &mut registry,
            1,
            Vec3::ZERO,
            EntityType::Npc,
            ReplicationPriority::Normal,
        );
        let near_b = add(
            &mut registry,
            2,
            Vec3::new(400_000.0, 0.0, 0.0),
            EntityType::Npc,
            ReplicationPriority::Normal,
        );

        let viewers = vec![
            Viewer {
                client_id: 1,
                location: Vec3::ZERO,
            },
            Viewer {
                client_id: 2,
                location: Vec3::new(400_000.0, 0.0, 0.0),
            },
        ];
        scheduler.tick(&mut registry, &viewers, 0.0);

        assert_eq!(scheduler.cancel_viewer(1), 1);
        assert_eq!(scheduler.cancel_viewer(1), 0);

        let outbox = scheduler.drain_outbox();
        assert!(!outbox.contains_key(&1));
        assert_eq!(outbox.get(&2), Some(&vec![near_b]));
        assert_ne!(near_a, near_b);
    }

    #[test]
    fn test_stats_accumulate() {
        let config = ReplicationConfig::default();
        let mut registry = EntityRegistry::new(&config);
        let mut scheduler = ReplicationScheduler::new(&config);
        add(
            &mut registry,
            1,
            Vec3::ZERO,
            EntityType::Npc,
            ReplicationPriority::Normal,
        );

        scheduler.tick(&mut registry, &origin_viewer(), 0.0);
        scheduler.tick(&mut registry, &origin_viewer(), 1.0 / 30.0);

        let stats = scheduler.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.total_entities_replicated, 2);
        assert_eq!(stats.total_bytes_sent, 96);
        assert_eq!(stats.average_bytes_per_tick(), 48.0);
    }
}
