use clap::Parser;
use log::info;
use server::network::Server;
use shared::Config;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Tick rate (updates per second), overrides the config file
    #[clap(short, long)]
    tick_rate: Option<u32>,
    /// Maximum number of players on this node, overrides the config file
    #[clap(short, long)]
    max_players: Option<usize>,
    /// Mesh node ID, overrides the config file
    #[clap(short, long)]
    node_id: Option<u32>,
    /// TOML config with [replication], [connection], [mesh] and [[zones]]
    #[clap(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(tick_rate) = args.tick_rate {
        config.replication.tick_rate = tick_rate;
    }
    if let Some(max_players) = args.max_players {
        config.mesh.max_players = max_players;
    }
    if let Some(node_id) = args.node_id {
        config.mesh.node_id = node_id;
    }

    info!(
        "Starting mesh node {} with {} zones",
        config.mesh.node_id,
        config.zones.len()
    );

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, config).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            let _ = shutdown.send(server::network::ServerMessage::Shutdown);
        }
    });

    server.run().await
}
