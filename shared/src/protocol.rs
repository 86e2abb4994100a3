//! Wire protocol between clients and mesh servers.
//!
//! Packets are `bincode`-encoded and sent one per UDP datagram.

use crate::error::ReplicationError;
use crate::math::{Rotator, Vec3};
use crate::types::{ClientId, EntityType, NetworkId, NodeId};
use bincode::{deserialize, serialize};
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest datagram either side will try to read
pub const MAX_PACKET_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Handshake,
    PositionUpdate,
    RotationUpdate,
    VelocityUpdate,
    PhysicsState,
    ChatMessage,
    VoiceData,
    Custom(u8),
}

/// Generic addressed message. `target_id` of `None` means every client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub message_type: MessageType,
    pub sender_id: ClientId,
    pub target_id: Option<ClientId>,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl NetworkMessage {
    pub fn new<T: Serialize>(
        message_type: MessageType,
        sender_id: ClientId,
        sequence: u32,
        payload: &T,
    ) -> Result<Self, ReplicationError> {
        Ok(Self {
            message_type,
            sender_id,
            target_id: None,
            sequence,
            payload: serialize(payload)?,
        })
    }

    pub fn with_target(mut self, target: ClientId) -> Self {
        self.target_id = Some(target);
        self
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ReplicationError> {
        Ok(deserialize(&self.payload)?)
    }
}

/// Full kinematic state; payload of `PhysicsState` messages and the
/// element type of replication packets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub network_id: NetworkId,
    pub entity_type: EntityType,
    pub location: Vec3,
    pub rotation: Rotator,
    pub velocity: Vec3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    Connected {
        client_id: ClientId,
        network_id: NetworkId,
    },
    Disconnect,
    Disconnected {
        reason: String,
    },
    Heartbeat {
        timestamp: u64,
    },
    HeartbeatAck {
        timestamp: u64,
    },
    Message(NetworkMessage),
    /// `sequence` counts replication packets per recipient, so a gap
    /// means a lost packet even when `tick` skips quiet ticks.
    Replication {
        tick: u32,
        sequence: u32,
        timestamp: u64,
        entities: Vec<EntityState>,
    },
    EntityRemoved {
        network_id: NetworkId,
    },
    ZoneHandoff {
        network_id: NetworkId,
        from_zone: String,
        to_zone: String,
        target_node: NodeId,
    },
}

/// Encodes a packet. Anything above `MAX_PACKET_SIZE` is logged but
/// still returned.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, ReplicationError> {
    let bytes = serialize(packet)?;
    if bytes.len() > MAX_PACKET_SIZE {
        warn!(
            "Encoded packet is {} bytes, above the {} byte limit",
            bytes.len(),
            MAX_PACKET_SIZE
        );
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Packet, ReplicationError> {
    Ok(deserialize(bytes)?)
}

/// Rejects duplicate and stale sequence numbers, tolerating wraparound.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceTracker {
    last: Option<u32>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `sequence` is newer than anything seen so far.
    pub fn accept(&mut self, sequence: u32) -> bool {
        match self.last {
            Some(last) if (sequence.wrapping_sub(last) as i32) <= 0 => false,
            _ => {
                self.last = Some(sequence);
                true
            }
        }
    }

    pub fn last(&self) -> Option<u32> {
        self.last
    }
}

/// Wall-clock milliseconds since the Unix epoch
pub fn get_timestamp() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_serialization_connect() {
        let packet = Packet::Connect { client_version: 42 };
        let bytes = encode(&packet).unwrap();

        match decode(&bytes).unwrap() {
            Packet::Connect { client_version } => assert_eq!(client_version, 42),
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_position_message_payload() {
        let location = Vec3::new(10.0, -20.0, 30.5);
        let message = NetworkMessage::new(MessageType::PositionUpdate, 3, 17, &location)
            .unwrap()
            .with_target(9);

        let bytes = encode(&Packet::Message(message)).unwrap();
        match decode(&bytes).unwrap() {
            Packet::Message(m) => {
                assert_eq!(m.message_type, MessageType::PositionUpdate);
                assert_eq!(m.sender_id, 3);
                assert_eq!(m.target_id, Some(9));
                assert_eq!(m.sequence, 17);
                assert_eq!(m.decode_payload::<Vec3>().unwrap(), location);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_replication_packet() {
        let entities = vec![EntityState {
            network_id: NetworkId(5),
            entity_type: EntityType::Projectile,
            location: Vec3::new(1.0, 2.0, 3.0),
            rotation: Rotator::ZERO,
            velocity: Vec3::new(0.0, 0.0, 100.0),
        }];

        let packet = Packet::Replication {
            tick: 9,
            sequence: 3,
            timestamp: 1234,
            entities,
        };

        match decode(&encode(&packet).unwrap()).unwrap() {
            Packet::Replication {
                tick,
                sequence,
                timestamp,
                entities,
            } => {
                assert_eq!(tick, 9);
                assert_eq!(sequence, 3);
                assert_eq!(timestamp, 1234);
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].network_id, NetworkId(5));
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_oversized_packet_is_still_encoded() {
        let state = EntityState {
            network_id: NetworkId(1),
            entity_type: EntityType::Projectile,
            location: Vec3::ZERO,
            rotation: Rotator::ZERO,
            velocity: Vec3::ZERO,
        };
        let packet = Packet::Replication {
            tick: 1,
            sequence: 0,
            timestamp: 0,
            entities: vec![state; 1_000],
        };

        let bytes = encode(&packet).unwrap();
        assert!(bytes.len() > MAX_PACKET_SIZE);
        assert!(decode(&bytes).is_ok());
    }

    #[test]
    fn test_malformed_packet_is_error() {
        let bytes = encode(&Packet::Disconnected {
            reason: "Server full".to_string(),
        })
        .unwrap();

        assert!(decode(&bytes[..bytes.len() / 2]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn test_sequence_tracker_rejects_duplicates_and_stale() {
        let mut tracker = SequenceTracker::new();
        assert!(tracker.accept(1));
        assert!(!tracker.accept(1));
        assert!(tracker.accept(3));
        assert!(!tracker.accept(2));
        assert!(tracker.accept(4));
        assert_eq!(tracker.last(), Some(4));
    }

    #[test]
    fn test_sequence_tracker_wraparound() {
        let mut tracker = SequenceTracker::new();
        assert!(tracker.accept(u32::MAX - 1));
        assert!(tracker.accept(u32::MAX));
        assert!(tracker.accept(0));
        assert!(tracker.accept(1));
        assert!(!tracker.accept(u32::MAX));
    }
}
