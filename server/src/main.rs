use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::network::Server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Maximum number of connected participants
    #[arg(short, long, default_value = "8")]
    max_clients: usize,

    /// Ready-ups needed to start the countdown
    #[arg(short, long, default_value = "2")]
    quorum: i64,

    /// Seconds without a packet before a participant is dropped
    #[arg(long, default_value = "5")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        max_clients: args.max_clients,
        client_timeout: std::time::Duration::from_secs(args.timeout_secs),
        ..ServerConfig::default()
    }
    .with_tick_rate(args.tick_rate);
    config.rules.quorum = args.quorum;

    info!("Starting authority on {}", config.bind_addr);
    info!(
        "Tick rate {}Hz, up to {} participants, quorum {}",
        args.tick_rate, config.max_clients, config.rules.quorum
    );

    let mut server = Server::new(config).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
