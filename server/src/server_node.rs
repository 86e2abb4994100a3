//! A single backend node of the mesh: who is connected to it and how
//! busy it is.

use log::{info, warn};
use shared::{ClientId, MeshConfig, NodeId, Vec3};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadStatus {
    Idle,
    Low,
    Medium,
    High,
    Overloaded,
    Critical,
}

impl LoadStatus {
    /// Upper bounds are inclusive: 95.0 is still Overloaded.
    pub fn from_load(load: f32) -> Self {
        if load <= 20.0 {
            LoadStatus::Idle
        } else if load <= 40.0 {
            LoadStatus::Low
        } else if load <= 60.0 {
            LoadStatus::Medium
        } else if load <= 80.0 {
            LoadStatus::High
        } else if load <= 95.0 {
            LoadStatus::Overloaded
        } else {
            LoadStatus::Critical
        }
    }
}

/// Which players leave first when a node sheds load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferPolicy {
    /// Oldest connections first
    #[default]
    InOrder,
    /// Players with the worst ping first
    HighestPingFirst,
}

#[derive(Debug, Clone)]
pub struct ServerNode {
    server_id: NodeId,
    location: Vec3,
    max_players: usize,
    /// Connection order
    players: Vec<ClientId>,
    pings: HashMap<ClientId, f32>,
    cpu_usage: f32,
    memory_usage: f32,
    /// Mbit/s
    bandwidth_usage: f32,
    load: f32,
    transfer_policy: TransferPolicy,
}

impl ServerNode {
    /// Creates an idle node with no players
    ///
    /// All metrics start at zero and the transfer policy is `InOrder`.
    pub fn new(server_id: NodeId, location: Vec3, max_players: usize) -> Self {
        Self {
            server_id,
            location,
            max_players,
            players: Vec::new(),
            pings: HashMap::new(),
            cpu_usage: 0.0,
            memory_usage: 0.0,
            bandwidth_usage: 0.0,
            load: 0.0,
            transfer_policy: TransferPolicy::default(),
        }
    }

    /// Creates a node from the `[mesh]` config section
    pub fn from_config(config: &MeshConfig, location: Vec3) -> Self {
        Self::new(config.node_id, location, config.max_players)
    }

    pub fn server_id(&self) -> NodeId {
        self.server_id
    }

    pub fn location(&self) -> Vec3 {
        self.location
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// Number of players currently hosted
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Hosted players in join order
    pub fn players(&self) -> Vec<ClientId> {
        self.players.clone()
    }

    pub fn has_player(&self, client_id: ClientId) -> bool {
        self.players.contains(&client_id)
    }

    /// True once `max_players` have joined
    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players
    }

    /// Current load, 0..=100
    ///
    /// Recalculated whenever players or metrics change, so this is
    /// always in step with `calculate_load`.
    pub fn load(&self) -> f32 {
        self.load
    }

    /// Load bucket derived from `load`
    pub fn load_status(&self) -> LoadStatus {
        LoadStatus::from_load(self.load)
    }

    /// Chooses which players leave first in `transfer_players_to`
    pub fn set_transfer_policy(&mut self, policy: TransferPolicy) {
        self.transfer_policy = policy;
    }

    /// Returns false when the node is full. Adding a player that is
    /// already here is a no-op that succeeds.
    pub fn add_player(&mut self, client_id: ClientId) -> bool {
        if self.has_player(client_id) {
            return true;
        }
        if self.is_full() {
            warn!(
                "Node {} refused player {}: full ({} players)",
                self.server_id, client_id, self.max_players
            );
            return false;
        }
        self.players.push(client_id);
        self.recalculate_load();
        true
    }

    /// Removes a player and forgets its ping
    ///
    /// Returns false if the player was not on this node.
    pub fn remove_player(&mut self, client_id: ClientId) -> bool {
        let before = self.players.len();
        self.players.retain(|p| *p != client_id);
        if self.players.len() == before {
            return false;
        }
        self.pings.remove(&client_id);
        self.recalculate_load();
        true
    }

    /// Last measured round trip of a player, used by `HighestPingFirst`.
    pub fn set_player_ping(&mut self, client_id: ClientId, ping_ms: f32) {
        if self.has_player(client_id) {
            self.pings.insert(client_id, ping_ms);
        }
    }

    /// CPU and memory in percent, bandwidth in Mbit/s.
    pub fn update_metrics(&mut self, cpu_usage: f32, memory_usage: f32, bandwidth_usage: f32) {
        self.cpu_usage = cpu_usage.clamp(0.0, 100.0);
        self.memory_usage = memory_usage.clamp(0.0, 100.0);
        self.bandwidth_usage = bandwidth_usage.max(0.0);
        self.recalculate_load();
    }

    /// Keeps the CPU and memory figures, replaces bandwidth (Mbit/s).
    pub fn update_bandwidth_usage(&mut self, bandwidth_usage: f32) {
        self.bandwidth_usage = bandwidth_usage.max(0.0);
        self.recalculate_load();
    }

    /// Players weigh 50, CPU and memory together 30, bandwidth at most 20.
    pub fn calculate_load(&self) -> f32 {
        let player_load = if self.max_players == 0 {
            50.0
        } else {
            self.players.len() as f32 / self.max_players as f32 * 50.0
        };
        let resource_load = (self.cpu_usage + self.memory_usage) / 2.0 * 0.3;
        let bandwidth_load = (self.bandwidth_usage / 100.0 * 20.0).clamp(0.0, 20.0);

        (player_load + resource_load + bandwidth_load).clamp(0.0, 100.0)
    }

    pub fn should_transfer_players(&self) -> bool {
        matches!(
            self.load_status(),
            LoadStatus::Overloaded | LoadStatus::Critical
        )
    }

    /// Moves `round(players x fraction)` players to `target`. Players the
    /// target refuses stay here. Returns the players that moved.
    pub fn transfer_players_to(&mut self, target: &mut ServerNode, fraction: f32) -> Vec<ClientId> {
        let count = (self.players.len() as f32 * fraction.clamp(0.0, 1.0)).round() as usize;
        let selected: Vec<ClientId> = self.transfer_order().into_iter().take(count).collect();
        let moved = self.move_players(target, &selected);

        info!(
            "Node {} transferred {}/{} players to node {}",
            self.server_id,
            moved.len(),
            selected.len(),
            target.server_id
        );
        moved
    }

    /// Moves every player the target will take. Returns the players that
    /// had to stay behind.
    pub fn drain_into(&mut self, target: &mut ServerNode) -> Vec<ClientId> {
        let selected = self.transfer_order();
        let moved = self.move_players(target, &selected);

        if !self.players.is_empty() {
            warn!(
                "Node {} drained {} players into node {}, {} left over",
                self.server_id,
                moved.len(),
                target.server_id,
                self.players.len()
            );
        }
        self.players.clone()
    }

    fn transfer_order(&self) -> Vec<ClientId> {
        let mut order = self.players.clone();
        if self.transfer_policy == TransferPolicy::HighestPingFirst {
            // Stable sort keeps connection order among equal pings
            order.sort_by(|a, b| {
                let pa = self.pings.get(a).copied().unwrap_or(0.0);
                let pb = self.pings.get(b).copied().unwrap_or(0.0);
                pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        order
    }

    fn move_players(&mut self, target: &mut ServerNode, selected: &[ClientId]) -> Vec<ClientId> {
        let mut moved = Vec::new();
        for &client_id in selected {
            if target.add_player(client_id) {
                if let Some(ping) = self.pings.get(&client_id).copied() {
                    target.set_player_ping(client_id, ping);
                }
                self.remove_player(client_id);
                moved.push(client_id);
            }
        }
        moved
    }

    fn recalculate_load(&mut self) {
        self.load = self.calculate_load();
    }
}
