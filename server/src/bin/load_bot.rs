//! Connects a swarm of bots that wander around and report their
//! position, to put a running server under replication load.

use clap::Parser;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    decode, encode, get_timestamp, MessageType, NetworkMessage, Packet, Vec3, MAX_PACKET_SIZE,
    PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout, Instant};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    server: String,
    /// Number of bots to connect
    #[clap(short, long, default_value = "32")]
    bots: usize,
    /// How long each bot stays connected, in seconds
    #[clap(short, long, default_value = "30")]
    duration: u64,
    /// Bots spawn uniformly inside a cube of this half-size
    #[clap(long, default_value = "20000")]
    spread: f32,
    /// Movement speed in units per second
    #[clap(long, default_value = "500")]
    speed: f32,
}

#[derive(Debug, Default)]
struct BotReport {
    connected: bool,
    replication_packets: u64,
    entity_updates: u64,
}

async fn run_bot(
    index: usize,
    server: SocketAddr,
    args: Args,
) -> Result<BotReport, Box<dyn std::error::Error + Send + Sync>> {
    let mut report = BotReport::default();
    let mut rng = StdRng::from_entropy();
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut buffer = vec![0u8; MAX_PACKET_SIZE];

    socket
        .send_to(
            &encode(&Packet::Connect {
                client_version: PROTOCOL_VERSION,
            })?,
            server,
        )
        .await?;

    let client_id = match timeout(Duration::from_secs(2), socket.recv_from(&mut buffer)).await {
        Ok(Ok((len, _))) => match decode(&buffer[..len])? {
            Packet::Connected { client_id, .. } => client_id,
            Packet::Disconnected { reason } => {
                warn!("Bot {} refused: {}", index, reason);
                return Ok(report);
            }
            other => {
                warn!("Bot {} got unexpected {:?}", index, other);
                return Ok(report);
            }
        },
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            warn!("Bot {} timed out waiting for the server", index);
            return Ok(report);
        }
    };
    report.connected = true;

    let mut location = random_start(&mut rng, args.spread);
    let mut heading = random_direction(&mut rng);
    let mut sequence = 0u32;

    let mut move_timer = interval(Duration::from_millis(100));
    let mut heartbeat_timer = interval(Duration::from_secs(5));
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    while Instant::now() < deadline {
        tokio::select! {
            _ = move_timer.tick() => {
                if rng.gen_bool(0.05) {
                    heading = random_direction(&mut rng);
                }
                location += heading * (args.speed * 0.1);
                sequence = sequence.wrapping_add(1);

                let message = NetworkMessage::new(
                    MessageType::PositionUpdate,
                    client_id,
                    sequence,
                    &location,
                )?;
                socket.send_to(&encode(&Packet::Message(message))?, server).await?;
            }
            _ = heartbeat_timer.tick() => {
                let heartbeat = Packet::Heartbeat { timestamp: get_timestamp() };
                socket.send_to(&encode(&heartbeat)?, server).await?;
            }
            result = socket.recv_from(&mut buffer) => {
                let (len, _) = result?;
                if let Ok(Packet::Replication { entities, .. }) = decode(&buffer[..len]) {
                    report.replication_packets += 1;
                    report.entity_updates += entities.len() as u64;
                }
            }
        }
    }

    socket.send_to(&encode(&Packet::Disconnect)?, server).await?;
    Ok(report)
}

/// Picks a spawn point inside the cube of half-size `spread`
///
/// A zero spread puts every bot at the origin.
fn random_start(rng: &mut StdRng, spread: f32) -> Vec3 {
    let spread = spread.abs();
    if !spread.is_finite() {
        return Vec3::ZERO;
    }
    Vec3::new(
        rng.gen_range(-spread..=spread),
        rng.gen_range(-spread..=spread),
        rng.gen_range(-spread..=spread),
    )
}

fn random_direction(rng: &mut StdRng) -> Vec3 {
    let v = Vec3::new(
        rng.gen_range(-1.0..1.0),
        rng.gen_range(-1.0..1.0),
        rng.gen_range(-1.0..1.0),
    );
    let length = v.length();
    if length > f32::EPSILON {
        v * (1.0 / length)
    } else {
        Vec3::new(1.0, 0.0, 0.0)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let server: SocketAddr = args.server.parse()?;

    info!("Starting {} bots against {}", args.bots, server);

    let handles: Vec<_> = (0..args.bots)
        .map(|index| tokio::spawn(run_bot(index, server, args.clone())))
        .collect();

    let mut connected = 0;
    let mut packets = 0;
    let mut updates = 0;
    for handle in handles {
        match handle.await {
            Ok(Ok(report)) => {
                if report.connected {
                    connected += 1;
                }
                packets += report.replication_packets;
                updates += report.entity_updates;
            }
            Ok(Err(e)) => warn!("Bot failed: {}", e),
            Err(e) => warn!("Bot task panicked: {}", e),
        }
    }

    info!(
        "{}/{} bots connected, {} replication packets, {} entity updates",
        connected, args.bots, packets, updates
    );
    Ok(())
}
