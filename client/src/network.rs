use crate::connection::{ClientConnection, ConnectionAction, ConnectionEvent};
use crate::prediction::ClientPredictor;
use log::{debug, error, info, warn};
use shared::{
    decode, encode, get_timestamp, Config, EntityState, MessageType, NetworkId, NetworkMessage,
    Packet, Vec3, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::interval;

/// How often the client reports its own ship
const REPORT_INTERVAL: Duration = Duration::from_millis(100);
const FRAME_INTERVAL: Duration = Duration::from_millis(16);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    connection: ClientConnection,
    predictor: ClientPredictor,
    started: Instant,

    /// Latest authoritative state of everything we have heard about
    world: HashMap<NetworkId, EntityState>,
    location: Vec3,
    velocity: Vec3,
    sequence: u32,
}

impl Client {
    pub async fn new(server_addr: &str, config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            connection: ClientConnection::new(&config.connection),
            predictor: ClientPredictor::from_config(&config.replication),
            started: Instant::now(),
            world: HashMap::new(),
            location: Vec3::ZERO,
            velocity: Vec3::ZERO,
            sequence: 0,
        })
    }

    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut ClientConnection {
        &mut self.connection
    }

    pub fn predictor(&self) -> &ClientPredictor {
        &self.predictor
    }

    pub fn predictor_mut(&mut self) -> &mut ClientPredictor {
        &mut self.predictor
    }

    pub fn known_entities(&self) -> Vec<EntityState> {
        let mut states: Vec<EntityState> = self.world.values().copied().collect();
        states.sort_by_key(|s| s.network_id);
        states
    }

    /// Sets the motion our own ship reports to the server.
    pub fn set_motion(&mut self, location: Vec3, velocity: Vec3) {
        self.location = location;
        self.velocity = velocity;
    }

    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = encode(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        self.connection.record_sent(data.len());
        Ok(())
    }

    /// Begins the handshake. Completion arrives later as `Connected`.
    pub async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let now = self.now();
        let host = self.server_addr.ip().to_string();
        self.connection.connect(&host, self.server_addr.port(), now)?;
        self.poll_connection().await?;
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(ConnectionAction::SendDisconnect) = self.connection.disconnect() {
            self.send_packet(&Packet::Disconnect).await?;
        }
        self.world.clear();
        Ok(())
    }

    /// Carries out whatever the connection state machine asks for.
    /// Returns false once the connection is gone for good.
    async fn poll_connection(&mut self) -> Result<bool, Box<dyn std::error::Error>> {
        let now = self.now();
        for action in self.connection.poll(now) {
            match action {
                ConnectionAction::SendHandshake => {
                    debug!("Sending handshake to {}", self.server_addr);
                    self.send_packet(&Packet::Connect {
                        client_version: PROTOCOL_VERSION,
                    })
                    .await?;
                }
                ConnectionAction::SendHeartbeat => {
                    self.send_packet(&Packet::Heartbeat {
                        timestamp: get_timestamp(),
                    })
                    .await?;
                }
                ConnectionAction::SendDisconnect => {
                    self.send_packet(&Packet::Disconnect).await?;
                }
                ConnectionAction::GaveUp => {
                    error!("Could not reach {}", self.server_addr);
                    return Ok(false);
                }
                ConnectionAction::ConnectionLost => {
                    error!("Lost connection to {}", self.server_addr);
                    self.world.clear();
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn handle_packet(&mut self, packet: Packet) {
        let now = self.now();
        match packet {
            Packet::Connected {
                client_id,
                network_id,
            } => {
                self.connection.handle_handshake_ack(client_id, network_id, now);
            }

            Packet::HeartbeatAck { timestamp } => {
                let rtt = get_timestamp().saturating_sub(timestamp);
                self.connection.handle_heartbeat_ack(rtt as f32);
            }

            Packet::Replication {
                sequence, entities, ..
            } => {
                self.connection.record_replication_sequence(sequence);
                for state in entities {
                    if state.network_id != self.connection.network_id() {
                        self.predictor.apply_server_state(&state);
                    }
                    self.world.insert(state.network_id, state);
                }
            }

            Packet::EntityRemoved { network_id } => {
                self.world.remove(&network_id);
                self.predictor.forget(network_id);
            }

            Packet::ZoneHandoff {
                network_id,
                from_zone,
                to_zone,
                target_node,
            } => {
                info!(
                    "{} moved from {} to {} (node {})",
                    network_id, from_zone, to_zone, target_node
                );
            }

            Packet::Message(message) => {
                debug!(
                    "{:?} message from client {} ({} bytes)",
                    message.message_type,
                    message.sender_id,
                    message.payload.len()
                );
            }

            Packet::Disconnected { reason } => {
                self.connection.handle_server_disconnect(&reason, now);
                self.world.clear();
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }
    }

    async fn report_motion(&mut self, dt: f32) -> Result<(), Box<dyn std::error::Error>> {
        if !self.connection.is_connected() {
            return Ok(());
        }
        let client_id = match self.connection.client_id() {
            Some(id) => id,
            None => return Ok(()),
        };

        self.location += self.velocity * dt;
        self.sequence = self.sequence.wrapping_add(1);
        let position = NetworkMessage::new(
            MessageType::PositionUpdate,
            client_id,
            self.sequence,
            &self.location,
        )?;
        self.send_packet(&Packet::Message(position)).await?;

        self.sequence = self.sequence.wrapping_add(1);
        let velocity = NetworkMessage::new(
            MessageType::VelocityUpdate,
            client_id,
            self.sequence,
            &self.velocity,
        )?;
        self.send_packet(&Packet::Message(velocity)).await
    }

    /// Runs until the connection is lost, the server refuses us, or
    /// `duration` elapses.
    pub async fn run(&mut self, duration: Option<Duration>) -> Result<(), Box<dyn std::error::Error>> {
        self.connection.subscribe(|event| match event {
            ConnectionEvent::StateChanged { connected } => {
                info!("Connection state changed: connected = {}", connected)
            }
            ConnectionEvent::QualityChanged(quality) => info!(
                "Connection quality {:.0}/100 (ping {:.0}ms, loss {:.1}%, jitter {:.0}ms, stable: {})",
                quality.quality_score,
                quality.ping_ms,
                quality.packet_loss,
                quality.jitter_ms,
                quality.is_stable
            ),
        });

        self.connect().await?;

        let mut frame_interval = interval(FRAME_INTERVAL);
        let mut report_interval = interval(REPORT_INTERVAL);
        let mut poll_interval = interval(POLL_INTERVAL);
        let deadline = duration.map(|d| Instant::now() + d);

        let mut buffer = vec![0u8; MAX_PACKET_SIZE];

        loop {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                break;
            }

            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) if addr == self.server_addr => {
                            let now = self.now();
                            self.connection.record_received(len, now);
                            match decode(&buffer[..len]) {
                                Ok(packet) => self.handle_packet(packet),
                                Err(e) => warn!("Malformed packet from server: {}", e),
                            }
                        },
                        Ok((_, addr)) => debug!("Ignoring packet from {}", addr),
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = poll_interval.tick() => {
                    if !self.poll_connection().await? {
                        break;
                    }
                    if !self.connection.is_connected() && !self.connection.is_connecting() {
                        info!("Connection closed");
                        break;
                    }
                },

                _ = frame_interval.tick() => {
                    self.predictor.predict_all(FRAME_INTERVAL.as_secs_f32());
                },

                _ = report_interval.tick() => {
                    if let Err(e) = self.report_motion(REPORT_INTERVAL.as_secs_f32()).await {
                        error!("Error sending position: {}", e);
                    }
                },
            }
        }

        self.disconnect().await
    }
}
