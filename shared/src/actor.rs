//! Opaque actor handles the replication core reads transforms from.
//!
//! The core never mutates an actor. It only samples location, rotation
//! and velocity, and compares identities to avoid double registration.

use crate::math::{Rotator, Vec3};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stable identity of a game object, independent of its network ID
pub type ActorId = u64;

pub trait Actor: Send + Sync {
    fn actor_id(&self) -> ActorId;
    fn location(&self) -> Vec3;
    fn rotation(&self) -> Rotator;
    fn velocity(&self) -> Vec3;

    /// False once the underlying game object has been destroyed.
    fn is_alive(&self) -> bool {
        true
    }
}

pub type ActorRef = Arc<dyn Actor>;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transform {
    pub location: Vec3,
    pub rotation: Rotator,
    pub velocity: Vec3,
}

/// Actor whose transform is written by whoever owns it (a network
/// session, a simulation step) and read by the replication core.
#[derive(Debug)]
pub struct ProxyActor {
    id: ActorId,
    transform: RwLock<Transform>,
    alive: AtomicBool,
}

impl ProxyActor {
    pub fn new(id: ActorId, location: Vec3) -> Self {
        Self {
            id,
            transform: RwLock::new(Transform {
                location,
                ..Transform::default()
            }),
            alive: AtomicBool::new(true),
        }
    }

    pub fn shared(id: ActorId, location: Vec3) -> Arc<ProxyActor> {
        Arc::new(Self::new(id, location))
    }

    pub fn transform(&self) -> Transform {
        *self.transform.read()
    }

    pub fn set_location(&self, location: Vec3) {
        self.transform.write().location = location;
    }

    pub fn set_rotation(&self, rotation: Rotator) {
        self.transform.write().rotation = rotation;
    }

    pub fn set_velocity(&self, velocity: Vec3) {
        self.transform.write().velocity = velocity;
    }

    pub fn set_transform(&self, transform: Transform) {
        *self.transform.write() = transform;
    }

    /// Marks the actor destroyed; registries drop it on their next prune.
    pub fn destroy(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

impl Actor for ProxyActor {
    fn actor_id(&self) -> ActorId {
        self.id
    }

    fn location(&self) -> Vec3 {
        self.transform.read().location
    }

    fn rotation(&self) -> Rotator {
        self.transform.read().rotation
    }

    fn velocity(&self) -> Vec3 {
        self.transform.read().velocity
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}
