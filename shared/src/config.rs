//! Tunables for replication, connections and the server mesh.
//!
//! Every value has a default, so an empty TOML file is a valid config.
//! Command line flags in the binaries override what the file says.

use crate::error::ReplicationError;
use crate::math::Vec3;
use crate::types::{EntityType, NodeId};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Network ticks per second
    pub tick_rate: u32,
    pub max_entities_per_frame: usize,
    pub bandwidth_limit_bytes_per_sec: u32,
    /// Estimated wire cost of one entity update
    pub entity_cost_bytes: u32,
    /// Relevancy radius for players and player ships
    pub max_relevancy_distance: f32,
    /// Relevancy radius for stations and planets
    pub landmark_relevancy_distance: f32,
    /// Relevancy radius for projectiles and effects
    pub transient_relevancy_distance: f32,
    /// Relevancy radius for everything else
    pub default_relevancy_distance: f32,
    pub enable_client_prediction: bool,
    pub enable_server_meshing: bool,
    /// Remaining-budget fraction below which low priorities are put to sleep
    pub throttle_engage_fraction: f32,
    /// Remaining-budget fraction above which they are woken again
    pub throttle_release_fraction: f32,
    /// Throttled entities still get one update this often. `None` lets
    /// them sleep until the throttle releases.
    pub starvation_floor_secs: Option<f64>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            tick_rate: 30,
            max_entities_per_frame: 100,
            bandwidth_limit_bytes_per_sec: 1024 * 1024,
            entity_cost_bytes: 48,
            max_relevancy_distance: 100_000.0,
            landmark_relevancy_distance: 500_000.0,
            transient_relevancy_distance: 10_000.0,
            default_relevancy_distance: 50_000.0,
            enable_client_prediction: true,
            enable_server_meshing: true,
            throttle_engage_fraction: 0.2,
            throttle_release_fraction: 0.8,
            starvation_floor_secs: Some(5.0),
        }
    }
}

impl ReplicationConfig {
    pub fn tick_interval(&self) -> f64 {
        1.0 / self.tick_rate as f64
    }

    /// Bytes that may be spent in a single tick
    pub fn tick_budget_bytes(&self) -> u64 {
        (self.bandwidth_limit_bytes_per_sec as f64 / self.tick_rate as f64) as u64
    }

    pub fn relevancy_radius_for(&self, entity_type: EntityType) -> f32 {
        match entity_type {
            EntityType::Player | EntityType::PlayerShip => self.max_relevancy_distance,
            EntityType::Station | EntityType::Planet => self.landmark_relevancy_distance,
            EntityType::Projectile | EntityType::Effect => self.transient_relevancy_distance,
            _ => self.default_relevancy_distance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connection_timeout_secs: f64,
    pub max_connection_retries: u32,
    pub keep_alive_interval_secs: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 10.0,
            max_connection_retries: 3,
            keep_alive_interval_secs: 5.0,
        }
    }
}

impl ConnectionConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs_f64(self.keep_alive_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node_id: NodeId,
    pub max_players: usize,
    pub balance_interval_secs: f64,
    /// Zones above this load look for somewhere to shed entities
    pub overload_threshold: f32,
    /// How much lower a target zone's load must be
    pub min_load_gap: f32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            max_players: 64,
            balance_interval_secs: 30.0,
            overload_threshold: 80.0,
            min_load_gap: 20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub center: [f32; 3],
    pub radius: f32,
    pub node_id: NodeId,
}

impl ZoneConfig {
    pub fn center(&self) -> Vec3 {
        Vec3::new(self.center[0], self.center[1], self.center[2])
    }
}

/// Top-level file layout: `[replication]`, `[connection]`, `[mesh]` and
/// any number of `[[zones]]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub replication: ReplicationConfig,
    pub connection: ConnectionConfig,
    pub mesh: MeshConfig,
    pub zones: Vec<ZoneConfig>,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ReplicationError> {
        let config: Config = toml::from_str(text).map_err(|e| {
            warn!("Failed to parse config: {}", e);
            ReplicationError::Config(e.to_string())
        })?;
        if let Err(e) = config.validate() {
            warn!("Rejected config: {}", e);
            return Err(e);
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReplicationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            warn!("Cannot read config file {}: {}", path.display(), e);
            ReplicationError::Config(format!("{}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&text)?;
        info!(
            "Loaded config from {} ({} Hz, {} zones)",
            path.display(),
            config.replication.tick_rate,
            config.zones.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReplicationError> {
        let r = &self.replication;
        if r.tick_rate == 0 {
            return Err(ReplicationError::Config("tick_rate must be positive".into()));
        }
        if r.max_entities_per_frame == 0 {
            return Err(ReplicationError::Config(
                "max_entities_per_frame must be positive".into(),
            ));
        }
        if r.bandwidth_limit_bytes_per_sec == 0 || r.entity_cost_bytes == 0 {
            return Err(ReplicationError::Config(
                "bandwidth limit and entity cost must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&r.throttle_engage_fraction)
            || !(0.0..=1.0).contains(&r.throttle_release_fraction)
            || r.throttle_engage_fraction > r.throttle_release_fraction
        {
            return Err(ReplicationError::Config(
                "throttle fractions must satisfy 0 <= engage <= release <= 1".into(),
            ));
        }
        if self.connection.connection_timeout_secs <= 0.0
            || self.connection.keep_alive_interval_secs <= 0.0
        {
            return Err(ReplicationError::Config(
                "connection timeout and keep-alive interval must be positive".into(),
            ));
        }
        if self.mesh.max_players == 0 {
            return Err(ReplicationError::Config("max_players must be positive".into()));
        }
        if let Some(zone) = self.zones.iter().find(|z| z.radius <= 0.0) {
            return Err(ReplicationError::Config(format!(
                "zone radius must be positive, got {}",
                zone.radius
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.max_entities_per_frame, 100);
        assert_eq!(config.bandwidth_limit_bytes_per_sec, 1_048_576);
        assert_eq!(config.tick_budget_bytes(), 34_952);

        let conn = ConnectionConfig::default();
        assert_eq!(conn.connection_timeout(), Duration::from_secs(10));
        assert_eq!(conn.max_connection_retries, 3);
        assert_eq!(conn.keep_alive_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_radius_by_type() {
        let config = ReplicationConfig::default();
        assert_eq!(config.relevancy_radius_for(EntityType::PlayerShip), 100_000.0);
        assert_eq!(config.relevancy_radius_for(EntityType::Planet), 500_000.0);
        assert_eq!(config.relevancy_radius_for(EntityType::Effect), 10_000.0);
        assert_eq!(config.relevancy_radius_for(EntityType::Asteroid), 50_000.0);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_toml_overrides_and_zones() {
        let text = r#"
            [replication]
            tick_rate = 20
            starvation_floor_secs = 2.5

            [mesh]
            node_id = 4

            [[zones]]
            center = [0.0, 0.0, 0.0]
            radius = 1000.0
            node_id = 4
        "#;

        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.replication.tick_rate, 20);
        assert_eq!(config.replication.max_entities_per_frame, 100);
        assert_eq!(config.replication.starvation_floor_secs, Some(2.5));
        assert_eq!(config.mesh.node_id, 4);
        assert_eq!(config.zones.len(), 1);
        assert_eq!(config.zones[0].center(), Vec3::ZERO);
    }

    #[test]
    fn test_validation_rejects_zero_tick_rate() {
        let result = Config::from_toml_str("[replication]\ntick_rate = 0\n");
        assert!(matches!(result, Err(ReplicationError::Config(_))));
    }

    #[test]
    fn test_load_missing_file_names_the_path() {
        match Config::load("/nonexistent/voidmesh.toml") {
            Err(ReplicationError::Config(message)) => {
                assert!(message.contains("/nonexistent/voidmesh.toml"))
            }
            other => panic!("Expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_rejects_inverted_throttle_band() {
        let mut config = Config::default();
        config.replication.throttle_engage_fraction = 0.9;
        config.replication.throttle_release_fraction = 0.5;
        assert!(config.validate().is_err());
    }
}
