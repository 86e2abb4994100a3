//! # Shared Replication Types
//!
//! Types and helpers used by both the mesh server and the client:
//!
//! - world math (`Vec3`, `Rotator`)
//! - identifiers and classification (`NetworkId`, `EntityType`,
//!   `ReplicationPriority`)
//! - the opaque `Actor` handle the replication core samples transforms from
//! - the wire protocol (`Packet`, `NetworkMessage`) and its codec
//! - configuration, errors and the observer list used for events
//!
//! Nothing in here performs I/O apart from `Config::load`.

pub mod actor;
pub mod config;
pub mod error;
pub mod events;
pub mod math;
pub mod protocol;
pub mod types;

pub use actor::{Actor, ActorId, ActorRef, ProxyActor, Transform};
pub use config::{Config, ConnectionConfig, MeshConfig, ReplicationConfig, ZoneConfig};
pub use error::{ErrorEvent, ReplicationError};
pub use events::{EventBus, Subscription};
pub use math::{Rotator, Vec3};
pub use protocol::{
    decode, encode, get_timestamp, EntityState, MessageType, NetworkMessage, Packet,
    SequenceTracker, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
pub use types::{ClientId, EntityType, NetworkId, NodeId, ReplicationPriority};
