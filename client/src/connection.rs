//! Client connection state machine.
//!
//! Nothing in here waits or sleeps. The owner calls `poll` with the
//! current time and performs whatever actions come back: sending a
//! handshake, a heartbeat, or giving up. Cancelling pending work is just
//! clearing the deadlines.

use crate::quality::{ConnectionQuality, NetworkStatistics, QualityTracker};
use log::{info, warn};
use shared::{ClientId, ConnectionConfig, EventBus, NetworkId, ReplicationError, Subscription};

/// Score change that is worth telling observers about
const QUALITY_EVENT_DELTA: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Work the owner has to carry out after `poll`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    SendHandshake,
    SendHeartbeat,
    SendDisconnect,
    /// Retries exhausted while connecting
    GaveUp,
    /// The server went quiet while connected
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged { connected: bool },
    QualityChanged(ConnectionQuality),
}

pub struct ClientConnection {
    config: ConnectionConfig,
    state: ConnectionState,
    server_address: String,
    server_port: u16,
    client_id: Option<ClientId>,
    network_id: NetworkId,
    retry_count: u32,
    handshake_pending: bool,
    handshake_deadline: Option<f64>,
    next_keep_alive: Option<f64>,
    last_heard: f64,
    tracker: QualityTracker,
    reported_quality: Option<ConnectionQuality>,
    statistics: NetworkStatistics,
    events: EventBus<ConnectionEvent>,
}

impl ClientConnection {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            config: config.clone(),
            state: ConnectionState::Disconnected,
            server_address: String::new(),
            server_port: 0,
            client_id: None,
            network_id: NetworkId::NULL,
            retry_count: 0,
            handshake_pending: false,
            handshake_deadline: None,
            next_keep_alive: None,
            last_heard: 0.0,
            tracker: QualityTracker::new(),
            reported_quality: None,
            statistics: NetworkStatistics::default(),
            events: EventBus::new(),
        }
    }

    pub fn subscribe<F>(&mut self, callback: F) -> Subscription
    where
        F: FnMut(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, token: Subscription) -> bool {
        self.events.unsubscribe(token)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// The player ship the server registered for us
    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.tracker.quality()
    }

    pub fn statistics(&self) -> NetworkStatistics {
        self.statistics
    }

    /// Starts connecting. The handshake goes out on the next `poll`.
    pub fn connect(&mut self, address: &str, port: u16, now: f64) -> Result<(), ReplicationError> {
        match self.state {
            ConnectionState::Connected => return Err(ReplicationError::AlreadyConnected),
            ConnectionState::Connecting => return Err(ReplicationError::AlreadyConnecting),
            ConnectionState::Disconnected => {}
        }

        info!("Connecting to {}:{}", address, port);
        self.server_address = address.to_string();
        self.server_port = port;
        self.state = ConnectionState::Connecting;
        self.retry_count = 0;
        self.handshake_pending = true;
        self.handshake_deadline = Some(now + self.config.connection_timeout_secs);
        Ok(())
    }

    /// Advances timers and returns what has to be sent or reported.
    pub fn poll(&mut self, now: f64) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connecting => {
                if self.handshake_pending {
                    self.handshake_pending = false;
                    actions.push(ConnectionAction::SendHandshake);
                }
                if self.handshake_deadline.map_or(false, |deadline| now >= deadline) {
                    actions.push(self.handle_timeout(now));
                }
            }
            ConnectionState::Connected => {
                if now - self.last_heard >= self.config.connection_timeout_secs {
                    warn!(
                        "No packets from server for {:.1}s, connection lost",
                        now - self.last_heard
                    );
                    self.reset(false);
                    self.events
                        .emit(&ConnectionEvent::StateChanged { connected: false });
                    actions.push(ConnectionAction::ConnectionLost);
                } else if self.next_keep_alive.map_or(false, |due| now >= due) {
                    self.next_keep_alive = Some(now + self.config.keep_alive_interval_secs);
                    actions.push(ConnectionAction::SendHeartbeat);
                }
            }
        }

        actions
    }

    /// The handshake went unanswered. Retries until the limit, then
    /// gives up for good.
    pub fn handle_timeout(&mut self, now: f64) -> ConnectionAction {
        if self.retry_count < self.config.max_connection_retries {
            self.retry_count += 1;
            info!(
                "Handshake timed out, retry {}/{}",
                self.retry_count, self.config.max_connection_retries
            );
            self.handshake_deadline = Some(now + self.config.connection_timeout_secs);
            ConnectionAction::SendHandshake
        } else {
            warn!(
                "Giving up on {}:{} after {} retries",
                self.server_address, self.server_port, self.retry_count
            );
            self.reset(true);
            self.events
                .emit(&ConnectionEvent::StateChanged { connected: false });
            ConnectionAction::GaveUp
        }
    }

    /// The server accepted us. Returns false if we were not connecting.
    pub fn handle_handshake_ack(
        &mut self,
        client_id: ClientId,
        network_id: NetworkId,
        now: f64,
    ) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }

        info!("Connected as client {} with ship {}", client_id, network_id);
        self.state = ConnectionState::Connected;
        self.client_id = Some(client_id);
        self.network_id = network_id;
        self.retry_count = 0;
        self.handshake_pending = false;
        self.handshake_deadline = None;
        self.last_heard = now;
        self.next_keep_alive = Some(now + self.config.keep_alive_interval_secs);
        self.events
            .emit(&ConnectionEvent::StateChanged { connected: true });
        true
    }

    /// The server told us to go away.
    ///
    /// A refusal while connecting counts as a failed attempt: the
    /// handshake deadline expires immediately, so the next `poll` either
    /// retries or gives up through `handle_timeout`. A live connection
    /// ends right away with a state event.
    pub fn handle_server_disconnect(&mut self, reason: &str, now: f64) {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connecting => {
                warn!(
                    "Server refused the connection: {} (retry {}/{})",
                    reason, self.retry_count, self.config.max_connection_retries
                );
                self.handshake_pending = false;
                self.handshake_deadline = Some(now);
            }
            ConnectionState::Connected => {
                warn!("Server closed the connection: {}", reason);
                self.reset(true);
                self.events
                    .emit(&ConnectionEvent::StateChanged { connected: false });
            }
        }
    }

    /// Leaves the server. Safe to call any number of times; only the
    /// call that ends a live connection fires the state event.
    pub fn disconnect(&mut self) -> Option<ConnectionAction> {
        let previous = self.state;
        if previous == ConnectionState::Disconnected {
            return None;
        }

        self.reset(true);
        if previous == ConnectionState::Connected {
            info!("Disconnected from {}:{}", self.server_address, self.server_port);
            self.events
                .emit(&ConnectionEvent::StateChanged { connected: false });
        }
        Some(ConnectionAction::SendDisconnect)
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.statistics.record_sent(bytes);
    }

    pub fn record_received(&mut self, bytes: usize, now: f64) {
        self.statistics.record_received(bytes);
        self.tracker.record_bytes(bytes, now);
        if self.is_connected() {
            self.last_heard = now;
        }
    }

    /// Feeds the sequence number of an arrived replication packet to
    /// the loss measurement.
    pub fn record_replication_sequence(&mut self, sequence: u32) {
        self.tracker.record_sequence(sequence);
    }

    /// Feeds a heartbeat round trip in and reports a quality change if
    /// it is large enough to matter.
    pub fn handle_heartbeat_ack(&mut self, rtt_ms: f32) {
        self.tracker.record_round_trip(rtt_ms);
        let quality = self.tracker.quality();

        let changed = match self.reported_quality {
            Some(previous) => {
                previous.is_stable != quality.is_stable
                    || (previous.quality_score - quality.quality_score).abs()
                        >= QUALITY_EVENT_DELTA
            }
            None => true,
        };
        if changed {
            self.reported_quality = Some(quality);
            self.events.emit(&ConnectionEvent::QualityChanged(quality));
        }
    }

    /// Clears timers, buffers and measurements. `clear_statistics` also
    /// wipes the traffic counters.
    fn reset(&mut self, clear_statistics: bool) {
        self.state = ConnectionState::Disconnected;
        self.client_id = None;
        self.network_id = NetworkId::NULL;
        self.handshake_pending = false;
        self.handshake_deadline = None;
        self.next_keep_alive = None;
        self.tracker.reset();
        self.reported_quality = None;
        if clear_statistics {
            self.statistics = NetworkStatistics::default();
        }
    }
}
