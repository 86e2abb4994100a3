//! # Mesh Client Library
//!
//! Client side of the replication core: it connects to a mesh server,
//! reports its own ship, and keeps a smooth picture of every entity the
//! server decides it should see.
//!
//! ## Architecture Overview
//!
//! ### Connection State Machine
//! `ClientConnection` moves between Disconnected, Connecting and
//! Connected. It never blocks: handshake retries, keep-alives and
//! timeouts are deadlines checked by `poll`, which hands back the
//! packets that need sending. Observers subscribe to state and quality
//! changes.
//!
//! ### Dead Reckoning
//! Between server updates `ClientPredictor` moves every known entity
//! along its last replicated velocity. When fresh state arrives, small
//! errors snap and larger ones blend toward the server's answer.
//!
//! ### Connection Quality
//! Heartbeat round trips give ping and jitter, gaps in replication tick
//! numbers give packet loss. Together they form a 0..100 quality score.
//!
//! ## Module Organization
//!
//! - `connection`: the state machine, retries, keep-alive, events
//! - `prediction`: per-entity extrapolation and reconciliation
//! - `quality`: quality score, rolling measurements, traffic counters
//! - `network`: the UDP loop tying it all together
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//! use shared::Config;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new("127.0.0.1:8080", &Config::default()).await?;
//!     client.run(Some(Duration::from_secs(30))).await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod network;
pub mod prediction;
pub mod quality;
