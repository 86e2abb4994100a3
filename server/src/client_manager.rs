//! Server-side bookkeeping for connected clients.
//!
//! This module tracks every session the server has accepted:
//! - Connection lifecycle (connect, reconnect, disconnect, timeout)
//! - The proxy actor of each client's player ship
//! - Per-client sequence numbers for dropping stale messages
//! - Capacity limits and address lookups for the sender task
//!
//! The session writes the actor's transform from incoming messages and
//! the replication core reads it back during the tick.

use crate::scheduler::Viewer;
use log::info;
use shared::{ClientId, NetworkId, ProxyActor, SequenceTracker};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A connected client and the ship it flies
///
/// Each client carries:
/// - Connection metadata (ID, address, last activity)
/// - The network ID and proxy actor of its player ship
/// - The sequence tracker for its `Message` packets
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: ClientId,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// The client's player ship; `NULL` until it has been registered
    pub network_id: NetworkId,
    /// Transform source for the player ship
    pub actor: Option<Arc<ProxyActor>>,
    /// Per-sender ordering of `Message` packets
    pub sequence: SequenceTracker,
    /// Number of the next replication packet sent to this client
    pub replication_sequence: u32,
}

impl Client {
    /// Creates a new client with the given ID and network address
    ///
    /// The client starts without a ship and counts as recently active.
    pub fn new(id: ClientId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            network_id: NetworkId::NULL,
            actor: None,
            sequence: SequenceTracker::new(),
            replication_sequence: 0,
        }
    }

    /// Checks if the client has exceeded the connection timeout
    ///
    /// Returns true if nothing has been received from this client within
    /// `timeout`, which usually means it went away without saying so.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    /// Hands out the number for the next replication packet
    ///
    /// Numbers are per client and wrap at `u32::MAX`. Only packets that
    /// are actually queued take a number, so the client can tell lost
    /// packets from ticks that had nothing for it.
    pub fn next_replication_sequence(&mut self) -> u32 {
        let sequence = self.replication_sequence;
        self.replication_sequence = self.replication_sequence.wrapping_add(1);
        sequence
    }

    /// Where this client is looking from
    ///
    /// Returns `None` until a ship has been attached, so clients that
    /// are still mid-handshake receive no replication.
    pub fn viewer(&self) -> Option<Viewer> {
        self.actor.as_ref().map(|actor| Viewer {
            client_id: self.id,
            location: actor.transform().location,
        })
    }
}

/// Manages all connected clients
///
/// The ClientManager hands out client IDs, enforces the server's
/// capacity, and answers the address and viewpoint queries that the
/// tick loop and the sender task make every tick.
pub struct ClientManager {
    clients: HashMap<ClientId, Client>,
    next_client_id: ClientId,
    max_clients: usize,
    timeout: Duration,
}

impl ClientManager {
    /// Creates a new client manager
    ///
    /// `max_clients` caps concurrent sessions and `timeout` is how long a
    /// client may stay silent before `check_timeouts` drops it.
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
        }
    }

    /// Adds a new client if the server has room
    ///
    /// Returns the assigned client ID, or `None` when the server is at
    /// capacity. IDs increase monotonically and are never reused, so a
    /// reconnecting client always gets a fresh one.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<ClientId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, Client::new(client_id, addr));

        Some(client_id)
    }

    /// Links a client to its registered player ship
    ///
    /// Returns false if the client has already gone.
    pub fn attach_entity(
        &mut self,
        client_id: ClientId,
        network_id: NetworkId,
        actor: Arc<ProxyActor>,
    ) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.network_id = network_id;
                client.actor = Some(actor);
                true
            }
            None => false,
        }
    }

    /// Removes a client from the server
    ///
    /// Hands back the client's record so the caller can release what it
    /// owned (its ship, its player slot).
    pub fn remove_client(&mut self, client_id: &ClientId) -> Option<Client> {
        let client = self.clients.remove(client_id)?;
        info!("Client {} disconnected", client.id);
        Some(client)
    }

    /// Finds a client by their network address
    ///
    /// Used to map incoming packets to sessions. Returns `None` for
    /// addresses that have not completed a handshake.
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&client_id)
    }

    /// Marks the client as alive
    ///
    /// Returns false for unknown clients, so heartbeats from strangers
    /// go unanswered.
    pub fn touch(&mut self, client_id: ClientId) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Removes clients that have timed out
    ///
    /// Returns the removed records so the server can unregister their
    /// ships and tell everyone else.
    pub fn check_timeouts(&mut self) -> Vec<Client> {
        let timed_out: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(self.timeout))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .iter()
            .filter_map(|id| {
                info!("Client {} timed out", id);
                self.remove_client(id)
            })
            .collect()
    }

    /// Viewpoints of every client with a ship, in client ID order
    pub fn viewers(&self) -> Vec<Viewer> {
        let mut viewers: Vec<Viewer> = self.clients.values().filter_map(Client::viewer).collect();
        viewers.sort_by_key(|v| v.client_id);
        viewers
    }

    /// Gets all client network addresses for broadcasting
    pub fn get_client_addrs(&self) -> Vec<(ClientId, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    /// Current address of a client
    ///
    /// The sender task compares this with the address a queued packet was
    /// meant for, dropping packets for sessions that have ended.
    pub fn addr_of(&self, client_id: ClientId) -> Option<SocketAddr> {
        self.clients.get(&client_id).map(|c| c.addr)
    }

    /// Number of connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
