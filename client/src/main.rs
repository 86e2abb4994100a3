use clap::Parser;
use client::network::Client;
use log::info;
use shared::{Config, Vec3};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// TOML config with [replication] and [connection] sections
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Turn dead reckoning off
    #[arg(long)]
    no_prediction: bool,

    /// Disconnect after this many seconds
    #[arg(short = 'd', long)]
    duration: Option<u64>,

    /// Ship velocity along X, units per second
    #[arg(long, default_value = "0")]
    speed: f32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if args.no_prediction {
        config.replication.enable_client_prediction = false;
    }

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    info!(
        "Client prediction: {}",
        config.replication.enable_client_prediction
    );

    let mut client = Client::new(&args.server, &config).await?;
    client.set_motion(Vec3::ZERO, Vec3::new(args.speed, 0.0, 0.0));

    client.run(args.duration.map(Duration::from_secs)).await?;

    Ok(())
}
