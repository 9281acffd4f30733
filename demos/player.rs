// ABOUTME: End-to-end playback client
// ABOUTME: Connects to a server, keeps time sync and renders synchronized audio

use clap::Parser;
use snapstream::audio::format::SampleFormat;
use snapstream::client::{ClientSettings, Controller};
use snapstream::transport::Endpoint;

/// Synchronized audio player
#[derive(Parser, Debug)]
#[command(name = "player")]
#[command(about = "Connect to a snapstream server and play audio in sync", long_about = None)]
struct Args {
    /// Server address (tcp://, tls://, ws://, wss:// or rist://)
    #[arg(short, long, default_value = "tcp://localhost:1704")]
    server: String,

    /// Stable client id; random when omitted
    #[arg(long)]
    host_id: Option<String>,

    /// Instance index, for several players on one machine
    #[arg(short, long, default_value_t = 1)]
    instance: u32,

    /// Additional playback latency in ms, subtracted from the buffer
    #[arg(long, default_value_t = 0)]
    latency: i64,

    /// Player backend: cpal or null
    #[arg(long, default_value = "cpal")]
    player: String,

    /// Output format override, e.g. "44100:16:2" or "*:16:*"
    #[arg(long)]
    format: Option<String>,

    /// Username for servers that require authentication
    #[arg(long)]
    user: Option<String>,

    /// Password for servers that require authentication
    #[arg(long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let endpoint: Endpoint = args.server.parse()?;
    let mut settings = ClientSettings::new(endpoint);
    settings.host_id = args
        .host_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    settings.instance = args.instance;
    settings.latency_ms = args.latency;
    settings.player = args.player;
    settings.username = args.user;
    settings.password = args.password;
    if let Some(format) = args.format {
        settings.player_format = format.parse::<SampleFormat>()?;
    }

    println!("Connecting to {}...", settings.server);
    let mut controller = Controller::new(settings);
    controller.run().await?;
    Ok(())
}
