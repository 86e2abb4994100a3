use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier the server assigns to every replicated entity.
///
/// IDs start at 1 and only ever grow; `NetworkId::NULL` (0) is never
/// handed out and marks "no entity".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NetworkId(pub u32);

impl NetworkId {
    pub const NULL: NetworkId = NetworkId(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Client ID assigned by the server on connect
pub type ClientId = u32;

/// Server node identifier within the mesh
pub type NodeId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Player,
    PlayerShip,
    Npc,
    NpcShip,
    Projectile,
    Station,
    Planet,
    Asteroid,
    Effect,
    Pickup,
    Environmental,
}

impl EntityType {
    /// Weight applied to the scheduling score; players matter most,
    /// cosmetic effects least.
    pub fn type_weight(self) -> f32 {
        match self {
            EntityType::Player | EntityType::PlayerShip => 2.0,
            EntityType::Projectile => 1.5,
            EntityType::Effect => 0.5,
            _ => 1.0,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum ReplicationPriority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
    Critical,
}

impl ReplicationPriority {
    pub const ALL: [ReplicationPriority; 6] = [
        ReplicationPriority::VeryLow,
        ReplicationPriority::Low,
        ReplicationPriority::Normal,
        ReplicationPriority::High,
        ReplicationPriority::VeryHigh,
        ReplicationPriority::Critical,
    ];

    /// Send-rate multiplier. Also the base of the scheduling score.
    pub fn multiplier(self) -> f32 {
        match self {
            ReplicationPriority::VeryLow => 0.5,
            ReplicationPriority::Low => 0.75,
            ReplicationPriority::Normal => 1.0,
            ReplicationPriority::High => 1.5,
            ReplicationPriority::VeryHigh => 2.0,
            ReplicationPriority::Critical => 3.0,
        }
    }

    /// Priorities the bandwidth throttle is allowed to put to sleep
    pub fn is_throttleable(self) -> bool {
        matches!(self, ReplicationPriority::VeryLow | ReplicationPriority::Low)
    }
}
