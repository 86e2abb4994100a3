//! # Mesh Server Library
//!
//! Authoritative side of the replication core. The server decides which
//! entities each client hears about, how often, and which backend node
//! of the mesh is responsible for them.
//!
//! ## Core Responsibilities
//!
//! ### Entity Replication
//! Every replicated game object is registered with the `EntityRegistry`
//! and gets a `NetworkId` that is never reused. Each network tick the
//! `ReplicationScheduler` picks the entities that are due, relevant to
//! at least one client and awake, ranks them by priority, distance and
//! type, and sends as many as the per-tick byte budget allows.
//!
//! ### Bandwidth Control
//! When the leftover budget drops below 20 % the scheduler puts low
//! priority entities to sleep, and wakes them once more than 80 % is
//! free again. Sleeping entities still get an occasional update so they
//! never go stale forever.
//!
//! ### Server Meshing
//! World space is split into zones owned by backend nodes. The
//! `ServerMeshCoordinator` tracks zone load, finds entities that should
//! leave an overloaded zone and hands them off to a quieter one. Each
//! `ServerNode` tracks its own players and composite load, and can shed
//! players to another node.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Tick
//! All replication decisions run on one task, in one tick loop. Packet
//! I/O lives in separate tokio tasks (receiver, sender, timeout checker)
//! that talk to the tick loop over channels, so no decision logic is
//! ever shared between threads.
//!
//! ### UDP-Based Communication
//! Packets are `bincode`-encoded, one per datagram. Losing a replication
//! packet is harmless since the next tick carries fresher state.
//!
//! ## Module Organization
//!
//! - `registry`: entity metadata, ID assignment, dormancy
//! - `relevancy`: distance checks and update intervals
//! - `scheduler`: per-tick selection under the byte budget, throttling
//! - `mesh`: zones, load balancing and entity handoff
//! - `server_node`: player capacity, load status and player transfer
//! - `manager`: owns the above and runs them in tick order
//! - `client_manager`: connected clients and their player ships
//! - `network`: UDP tasks and the main loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use shared::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new("127.0.0.1:8080", Config::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod manager;
pub mod mesh;
pub mod network;
pub mod registry;
pub mod relevancy;
pub mod scheduler;
pub mod server_node;
