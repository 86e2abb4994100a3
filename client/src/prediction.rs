//! Dead reckoning for replicated entities, and reconciliation once the
//! authoritative state arrives.
//!
//! Small errors snap straight to the server state. Larger errors blend
//! toward it, faster the further off the prediction was, so a large
//! correction never lands in a single visible jump unless it is huge.

use log::debug;
use shared::{EntityState, NetworkId, ReplicationConfig, Rotator, Vec3};
use std::collections::HashMap;

/// Errors up to this distance are corrected by snapping
pub const DEFAULT_ERROR_TOLERANCE: f32 = 100.0;

/// Error at which the blend factor reaches 1
const FULL_CORRECTION_ERROR: f32 = 1000.0;
const MIN_BLEND: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientPredictionState {
    pub predicted_location: Vec3,
    pub predicted_rotation: Rotator,
    pub predicted_velocity: Vec3,
    /// Seconds extrapolated since the last reconciliation
    pub prediction_time: f32,
    pub error_tolerance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciliation {
    Snapped { error: f32 },
    Blended { error: f32, alpha: f32 },
}

impl Reconciliation {
    pub fn error(&self) -> f32 {
        match *self {
            Reconciliation::Snapped { error } | Reconciliation::Blended { error, .. } => error,
        }
    }
}

pub struct ClientPredictor {
    enabled: bool,
    error_tolerance: f32,
    states: HashMap<NetworkId, ClientPredictionState>,
}

impl ClientPredictor {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            error_tolerance: DEFAULT_ERROR_TOLERANCE,
            states: HashMap::new(),
        }
    }

    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self::new(config.enable_client_prediction)
    }

    pub fn with_error_tolerance(mut self, tolerance: f32) -> Self {
        self.error_tolerance = tolerance.max(0.0);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Turns prediction off and throws away all prediction state.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.states.clear();
    }

    /// Starts predicting an entity from a known state. Does nothing
    /// while prediction is disabled.
    pub fn track(&mut self, network_id: NetworkId, location: Vec3, rotation: Rotator, velocity: Vec3) {
        if !self.enabled {
            return;
        }
        self.states.insert(
            network_id,
            ClientPredictionState {
                predicted_location: location,
                predicted_rotation: rotation,
                predicted_velocity: velocity,
                prediction_time: 0.0,
                error_tolerance: self.error_tolerance,
            },
        );
    }

    pub fn forget(&mut self, network_id: NetworkId) -> bool {
        self.states.remove(&network_id).is_some()
    }

    pub fn state(&self, network_id: NetworkId) -> Option<ClientPredictionState> {
        self.states.get(&network_id).copied()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Extrapolates location along velocity. Orientation is left alone.
    pub fn predict_state(&mut self, network_id: NetworkId, dt: f32) -> Option<ClientPredictionState> {
        if !self.enabled {
            return None;
        }
        let state = self.states.get_mut(&network_id)?;
        state.predicted_location += state.predicted_velocity * dt;
        state.prediction_time += dt;
        Some(*state)
    }

    pub fn predict_all(&mut self, dt: f32) {
        if !self.enabled {
            return;
        }
        for state in self.states.values_mut() {
            state.predicted_location += state.predicted_velocity * dt;
            state.prediction_time += dt;
        }
    }

    /// Corrects a prediction toward the authoritative transform.
    pub fn reconcile(
        &mut self,
        network_id: NetworkId,
        server_location: Vec3,
        server_rotation: Rotator,
    ) -> Option<Reconciliation> {
        if !self.enabled {
            return None;
        }
        let state = self.states.get_mut(&network_id)?;
        let error = state.predicted_location.distance(server_location);

        let outcome = if error <= state.error_tolerance {
            state.predicted_location = server_location;
            state.predicted_rotation = server_rotation;
            Reconciliation::Snapped { error }
        } else {
            let alpha = (error / FULL_CORRECTION_ERROR).clamp(MIN_BLEND, 1.0);
            state.predicted_location = state.predicted_location.lerp(server_location, alpha);
            state.predicted_rotation = state.predicted_rotation.lerp(server_rotation, alpha);
            debug!(
                "Reconciled {} with error {:.1}, blend {:.2}",
                network_id, error, alpha
            );
            Reconciliation::Blended { error, alpha }
        };
        state.prediction_time = 0.0;

        Some(outcome)
    }

    /// Feeds a replicated state in: reconciles a tracked entity and
    /// adopts the server velocity, or starts tracking a new one.
    pub fn apply_server_state(&mut self, state: &EntityState) -> Option<Reconciliation> {
        if !self.enabled {
            return None;
        }
        match self.reconcile(state.network_id, state.location, state.rotation) {
            Some(outcome) => {
                if let Some(predicted) = self.states.get_mut(&state.network_id) {
                    predicted.predicted_velocity = state.velocity;
                }
                Some(outcome)
            }
            None => {
                self.track(state.network_id, state.location, state.rotation, state.velocity);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const ID: NetworkId = NetworkId(1);

    fn predictor_at(location: Vec3, velocity: Vec3) -> ClientPredictor {
        let mut predictor = ClientPredictor::new(true);
        predictor.track(ID, location, Rotator::ZERO, velocity);
        predictor
    }

    #[test]
    fn test_predict_moves_along_velocity() {
        let mut predictor = predictor_at(Vec3::ZERO, Vec3::new(10.0, 0.0, -5.0));
        predictor.predict_state(ID, 0.5);
        let state = predictor.predict_state(ID, 0.5).unwrap();

        assert_eq!(state.predicted_location, Vec3::new(10.0, 0.0, -5.0));
        assert_approx_eq!(state.prediction_time, 1.0);
        assert_eq!(state.predicted_rotation, Rotator::ZERO);
    }

    #[test]
    fn test_small_error_snaps() {
        let mut predictor = predictor_at(Vec3::ZERO, Vec3::ZERO);
        predictor.predict_state(ID, 1.0);

        let server = Vec3::new(60.0, 0.0, 0.0);
        let outcome = predictor
            .reconcile(ID, server, Rotator::new(0.0, 90.0, 0.0))
            .unwrap();

        assert!(matches!(outcome, Reconciliation::Snapped { .. }));
        let state = predictor.state(ID).unwrap();
        assert_eq!(state.predicted_location, server);
        assert_eq!(state.predicted_rotation.yaw, 90.0);
        assert_eq!(state.prediction_time, 0.0);
    }

    #[test]
    fn test_large_error_blends() {
        let mut predictor = predictor_at(Vec3::ZERO, Vec3::ZERO);

        let outcome = predictor.reconcile(ID, Vec3::new(500.0, 0.0, 0.0), Rotator::ZERO);
        match outcome {
            Some(Reconciliation::Blended { error, alpha }) => {
                assert_approx_eq!(error, 500.0);
                assert_approx_eq!(alpha, 0.5);
            }
            other => panic!("Expected blend, got {:?}", other),
        }
        assert_approx_eq!(predictor.state(ID).unwrap().predicted_location.x, 250.0);
    }

    #[test]
    fn test_blend_factor_is_clamped() {
        let mut predictor = predictor_at(Vec3::ZERO, Vec3::ZERO);
        let outcome = predictor
            .reconcile(ID, Vec3::new(5_000.0, 0.0, 0.0), Rotator::ZERO)
            .unwrap();
        assert_eq!(outcome, Reconciliation::Blended { error: 5_000.0, alpha: 1.0 });

        let mut predictor = predictor_at(Vec3::ZERO, Vec3::ZERO).with_error_tolerance(10.0);
        predictor.track(ID, Vec3::ZERO, Rotator::ZERO, Vec3::ZERO);
        match predictor.reconcile(ID, Vec3::new(50.0, 0.0, 0.0), Rotator::ZERO) {
            Some(Reconciliation::Blended { alpha, .. }) => assert_approx_eq!(alpha, 0.1),
            other => panic!("Expected blend, got {:?}", other),
        }
    }

    #[test]
    fn test_reconciled_location_stays_on_segment() {
        let servers = [
            Vec3::new(50.0, 0.0, 0.0),
            Vec3::new(150.0, -40.0, 10.0),
            Vec3::new(900.0, 900.0, 0.0),
            Vec3::new(-3_000.0, 0.0, 2_000.0),
        ];

        for server in servers {
            let start = Vec3::new(10.0, 20.0, 30.0);
            let mut predictor = predictor_at(start, Vec3::ZERO);
            predictor.reconcile(ID, server, Rotator::ZERO);

            let result = predictor.state(ID).unwrap().predicted_location;
            let whole = start.distance(server);
            let along = start.distance(result) + result.distance(server);
            assert!(
                (along - whole).abs() <= whole * 1e-4 + 1e-3,
                "{} left the segment toward {}",
                result,
                server
            );
            assert!(result.distance(server) <= whole + 1e-3);
        }
    }

    #[test]
    fn test_disable_discards_state() {
        let mut predictor = predictor_at(Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0));
        predictor.disable();

        assert!(predictor.is_empty());
        assert!(predictor.predict_state(ID, 1.0).is_none());
        assert!(predictor.reconcile(ID, Vec3::ZERO, Rotator::ZERO).is_none());

        predictor.track(ID, Vec3::ZERO, Rotator::ZERO, Vec3::ZERO);
        assert!(predictor.is_empty());

        predictor.enable();
        predictor.track(ID, Vec3::ZERO, Rotator::ZERO, Vec3::ZERO);
        assert_eq!(predictor.len(), 1);
    }

    #[test]
    fn test_apply_server_state_tracks_then_reconciles() {
        let mut predictor = ClientPredictor::new(true);
        let mut state = EntityState {
            network_id: ID,
            entity_type: shared::EntityType::NpcShip,
            location: Vec3::ZERO,
            rotation: Rotator::ZERO,
            velocity: Vec3::new(100.0, 0.0, 0.0),
        };

        assert!(predictor.apply_server_state(&state).is_none());
        predictor.predict_all(1.0);
        assert_eq!(predictor.state(ID).unwrap().predicted_location.x, 100.0);

        state.location = Vec3::new(120.0, 0.0, 0.0);
        state.velocity = Vec3::new(0.0, 50.0, 0.0);
        let outcome = predictor.apply_server_state(&state).unwrap();
        assert_approx_eq!(outcome.error(), 20.0);

        let predicted = predictor.state(ID).unwrap();
        assert_eq!(predicted.predicted_location, state.location);
        assert_eq!(predicted.predicted_velocity, state.velocity);

        assert!(predictor.forget(ID));
        assert!(predictor.state(ID).is_none());
    }
}
