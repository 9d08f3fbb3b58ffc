use clap::{Parser, ValueEnum};
use client::network::{Client, ClientOptions};
use log::info;
use shared::PlayerClass;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClassArg {
    Builder,
    Shooter,
}

impl From<ClassArg> for PlayerClass {
    fn from(arg: ClassArg) -> Self {
        match arg {
            ClassArg::Builder => PlayerClass::Builder,
            ClassArg::Shooter => PlayerClass::Shooter,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Class to claim in the lobby
    #[arg(short = 'c', long, value_enum)]
    class: Option<ClassArg>,

    /// Ready up as soon as the class claim is confirmed
    #[arg(short = 'r', long)]
    auto_ready: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    if let Some(class) = args.class {
        info!("Will claim {:?}{}", class, if args.auto_ready { " and ready up" } else { "" });
    }

    let options = ClientOptions {
        desired_class: args.class.map(PlayerClass::from),
        auto_ready: args.auto_ready,
        ..ClientOptions::default()
    };
    let mut client = Client::new(&args.server, options).await?;

    client.run().await?;

    Ok(())
}
