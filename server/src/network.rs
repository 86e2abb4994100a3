//! Server network layer: UDP I/O tasks feeding the single-threaded
//! replication tick.

use crate::client_manager::{Client, ClientManager};
use crate::manager::{ReplicationManager, TickOutput};
use log::{debug, error, info, warn};
use shared::{
    decode, encode, get_timestamp, ClientId, Config, EntityState, EntityType, MessageType,
    NetworkMessage, Packet, ProxyActor, ReplicationPriority, Rotator, Vec3, MAX_PACKET_SIZE,
    PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};

/// Entity states per `Replication` datagram; keeps packets well under
/// `MAX_PACKET_SIZE`.
const MAX_STATES_PER_PACKET: usize = 128;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { client: Client },
    Shutdown,
}

/// Messages sent from the tick loop to the sender task
#[derive(Debug)]
pub enum GameMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    /// Replication for one session. Dropped if that session has ended
    /// by the time the sender gets to it.
    SendToClient {
        packet: Packet,
        client_id: ClientId,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<ClientId>,
    },
}

impl GameMessage {
    pub fn packet(&self) -> &Packet {
        match self {
            GameMessage::SendPacket { packet, .. }
            | GameMessage::SendToClient { packet, .. }
            | GameMessage::BroadcastPacket { packet, .. } => packet,
        }
    }

    /// Addresses this message still has to reach, given who is
    /// connected right now.
    pub fn recipients(&self, clients: &ClientManager) -> Vec<SocketAddr> {
        match self {
            GameMessage::SendPacket { addr, .. } => vec![*addr],
            GameMessage::SendToClient {
                client_id, addr, ..
            } => match clients.addr_of(*client_id) {
                Some(current) if current == *addr => vec![*addr],
                _ => Vec::new(),
            },
            GameMessage::BroadcastPacket { exclude, .. } => clients
                .get_client_addrs()
                .into_iter()
                .filter(|(id, _)| Some(*id) != *exclude)
                .map(|(_, addr)| addr)
                .collect(),
        }
    }
}

pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    manager: ReplicationManager,
    config: Config,
    tick_duration: Duration,
    tick: u32,
    started: Instant,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(addr: &str, config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        let clients = ClientManager::new(
            config.mesh.max_players,
            config.connection.connection_timeout(),
        );

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(clients)),
            manager: ReplicationManager::new(&config),
            tick_duration: Duration::from_secs_f64(config.replication.tick_interval()),
            config,
            tick: 0,
            started: Instant::now(),
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle for stopping `run` from another task.
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    pub fn manager(&self) -> &ReplicationManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut ReplicationManager {
        &mut self.manager
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match decode(&buffer[..len]) {
                        Ok(packet) => {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        }
                        Err(e) => warn!("Malformed packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                let recipients = {
                    let clients_guard = clients.read().await;
                    message.recipients(&clients_guard)
                };
                if recipients.is_empty() {
                    if let GameMessage::SendToClient { client_id, .. } = &message {
                        debug!("Dropping stale update for departed client {}", client_id);
                    }
                    continue;
                }

                for addr in recipients {
                    if let Err(e) = Self::send_packet_impl(&socket, message.packet(), addr).await {
                        error!("Failed to send packet to {}: {}", addr, e);
                    }
                }
            }
        });
    }

    /// Spawns task that drops clients which stopped talking
    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = encode(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn broadcast_packet(&self, packet: Packet, exclude: Option<ClientId>) {
        if let Err(e) = self
            .game_tx
            .send(GameMessage::BroadcastPacket { packet, exclude })
        {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => self.handle_connect(client_version, addr).await,

            Packet::Disconnect => {
                let removed = {
                    let mut clients = self.clients.write().await;
                    match clients.find_client_by_addr(addr) {
                        Some(id) => clients.remove_client(&id),
                        None => None,
                    }
                };
                if let Some(client) = removed {
                    self.release_client(client);
                }
            }

            Packet::Heartbeat { timestamp } => {
                let known = {
                    let mut clients = self.clients.write().await;
                    match clients.find_client_by_addr(addr) {
                        Some(id) => clients.touch(id),
                        None => false,
                    }
                };
                if known {
                    self.send_packet(Packet::HeartbeatAck { timestamp }, addr);
                }
            }

            Packet::Message(message) => self.handle_message(message, addr).await,

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn handle_connect(&mut self, client_version: u32, addr: SocketAddr) {
        info!(
            "Client connecting from {} (version: {})",
            addr, client_version
        );

        if client_version != PROTOCOL_VERSION {
            self.send_packet(
                Packet::Disconnected {
                    reason: "Protocol version mismatch".to_string(),
                },
                addr,
            );
            return;
        }

        // A reconnect from the same address replaces the old session
        let existing = {
            let mut clients = self.clients.write().await;
            match clients.find_client_by_addr(addr) {
                Some(id) => clients.remove_client(&id),
                None => None,
            }
        };
        if let Some(client) = existing {
            info!("Removing existing client {} from {}", client.id, addr);
            self.release_client(client);
        }

        let client_id = {
            let mut clients = self.clients.write().await;
            clients.add_client(addr)
        };
        let client_id = match client_id {
            Some(id) if self.manager.node_mut().add_player(id) => id,
            Some(id) => {
                let mut clients = self.clients.write().await;
                clients.remove_client(&id);
                self.refuse_full(addr);
                return;
            }
            None => {
                self.refuse_full(addr);
                return;
            }
        };

        let actor = ProxyActor::shared(client_id as u64, Vec3::ZERO);
        let network_id = match self.manager.register(
            Some(actor.clone()),
            EntityType::PlayerShip,
            ReplicationPriority::High,
        ) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to register ship for client {}: {}", client_id, e);
                let removed = self.clients.write().await.remove_client(&client_id);
                if let Some(client) = removed {
                    self.release_client(client);
                }
                return;
            }
        };

        {
            let mut clients = self.clients.write().await;
            clients.attach_entity(client_id, network_id, actor);
        }

        self.send_packet(
            Packet::Connected {
                client_id,
                network_id,
            },
            addr,
        );
    }

    fn refuse_full(&self, addr: SocketAddr) {
        warn!("Refusing {}: server full", addr);
        self.send_packet(
            Packet::Disconnected {
                reason: "Server full".to_string(),
            },
            addr,
        );
    }

    async fn handle_message(&mut self, message: NetworkMessage, addr: SocketAddr) {
        let (client_id, actor) = {
            let mut clients = self.clients.write().await;
            let client_id = match clients.find_client_by_addr(addr) {
                Some(id) => id,
                None => {
                    debug!("Message from unknown address {}", addr);
                    return;
                }
            };
            clients.touch(client_id);

            let client = match clients.get_mut(client_id) {
                Some(client) => client,
                None => return,
            };
            if !client.sequence.accept(message.sequence) {
                debug!(
                    "Dropping stale message {} from client {}",
                    message.sequence, client_id
                );
                return;
            }
            (client_id, client.actor.clone())
        };

        match message.message_type {
            MessageType::PositionUpdate => {
                if let (Some(actor), Ok(location)) = (&actor, message.decode_payload::<Vec3>()) {
                    actor.set_location(location);
                }
            }
            MessageType::RotationUpdate => {
                if let (Some(actor), Ok(rotation)) = (&actor, message.decode_payload::<Rotator>())
                {
                    actor.set_rotation(rotation);
                }
            }
            MessageType::VelocityUpdate => {
                if let (Some(actor), Ok(velocity)) = (&actor, message.decode_payload::<Vec3>()) {
                    actor.set_velocity(velocity);
                }
            }
            MessageType::PhysicsState => {
                if let (Some(actor), Ok(state)) =
                    (&actor, message.decode_payload::<EntityState>())
                {
                    actor.set_location(state.location);
                    actor.set_rotation(state.rotation);
                    actor.set_velocity(state.velocity);
                }
            }
            MessageType::ChatMessage | MessageType::VoiceData | MessageType::Custom(_) => {
                self.relay(message, client_id).await;
            }
            MessageType::Handshake => {
                debug!("Ignoring handshake message from client {}", client_id);
            }
        }
    }

    /// Forwards a message to its target, or to everyone but the sender.
    async fn relay(&self, mut message: NetworkMessage, sender: ClientId) {
        message.sender_id = sender;
        match message.target_id {
            Some(target) => {
                let addr = self.clients.read().await.addr_of(target);
                match addr {
                    Some(addr) => self.send_packet(Packet::Message(message), addr),
                    None => debug!("Relay target {} is not connected", target),
                }
            }
            None => self.broadcast_packet(Packet::Message(message), Some(sender)),
        }
    }

    /// Frees everything a departed client owned and tells the others.
    fn release_client(&mut self, client: Client) {
        let dropped = self.manager.cancel_viewer(client.id);
        if dropped > 0 {
            debug!("Dropped {} queued updates for client {}", dropped, client.id);
        }
        self.manager.node_mut().remove_player(client.id);

        if !client.network_id.is_null() && self.manager.unregister(client.network_id) {
            self.broadcast_packet(
                Packet::EntityRemoved {
                    network_id: client.network_id,
                },
                Some(client.id),
            );
        }
    }

    async fn run_tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        let now = self.started.elapsed().as_secs_f64();

        let viewers = {
            let clients = self.clients.read().await;
            clients.viewers()
        };

        let output = self.manager.tick(&viewers, now);
        self.update_bandwidth_usage(&output);
        self.send_tick_output(output).await;

        if self.tick % 60 == 0 {
            let stats = self.manager.stats();
            debug!(
                "Tick {}: {} viewers, {} entities, {}/{} candidates sent, {:.0} B/tick avg, throttled: {}",
                self.tick,
                viewers.len(),
                self.manager.registry().len(),
                stats.last_tick_entities,
                stats.last_tick_candidates,
                stats.average_bytes_per_tick(),
                stats.throttled
            );
        }
    }

    fn update_bandwidth_usage(&mut self, output: &TickOutput) {
        let bytes_per_sec =
            output.report.bytes_used as f64 * self.config.replication.tick_rate as f64;
        let mbps = (bytes_per_sec * 8.0 / 1_000_000.0) as f32;
        self.manager.node_mut().update_bandwidth_usage(mbps);
    }

    async fn send_tick_output(&self, output: TickOutput) {
        for network_id in output.removed {
            self.broadcast_packet(Packet::EntityRemoved { network_id }, None);
        }
        for handoff in &output.handoffs {
            self.broadcast_packet(handoff.to_packet(), None);
        }

        if output.updates.is_empty() {
            return;
        }

        let timestamp = get_timestamp();
        let mut clients = self.clients.write().await;
        for (client_id, states) in &output.updates {
            let client = match clients.get_mut(*client_id) {
                Some(client) => client,
                None => continue,
            };
            for chunk in states.chunks(MAX_STATES_PER_PACKET) {
                let message = GameMessage::SendToClient {
                    packet: Packet::Replication {
                        tick: self.tick,
                        sequence: client.next_replication_sequence(),
                        timestamp,
                        entities: chunk.to_vec(),
                    },
                    client_id: *client_id,
                    addr: client.addr,
                };
                if let Err(e) = self.game_tx.send(message) {
                    error!("Failed to queue replication for client {}: {}", client_id, e);
                }
            }
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Server started: {} Hz, {} byte tick budget",
            self.config.replication.tick_rate,
            self.manager.scheduler().budget_bytes()
        );

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client }) => {
                            self.release_client(client);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    self.run_tick().await;
                },
            }
        }

        Ok(())
    }
}
