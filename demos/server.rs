// ABOUTME: Demo streaming server feeding a generated sine tone
// ABOUTME: Binds the configured listeners and broadcasts to every connected client

use std::f32::consts::TAU;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use snapstream::audio::chunk::PcmChunk;
use snapstream::audio::format::SampleFormat;
use snapstream::protocol::messages::Tv;
use snapstream::server::{Server, ServerOptions, DEFAULT_STREAM_ID};

/// Synchronized audio server with a built-in test tone
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Stream a test tone to snapstream clients", long_about = None)]
struct Args {
    /// TCP listen address
    #[arg(short, long, default_value = "0.0.0.0:1704")]
    bind: SocketAddr,

    /// Also listen for plain WebSocket clients on this address
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Also listen for RIST overlay clients on this address
    #[arg(long)]
    rist_bind: Option<SocketAddr>,

    /// End-to-end buffer in ms
    #[arg(long, default_value_t = 1000)]
    buffer: i64,

    /// Tone frequency in Hz
    #[arg(long, default_value_t = 440.0)]
    tone: f32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut options = ServerOptions::default();
    options.tcp_bind = Some(args.bind);
    options.ws_bind = args.ws_bind;
    options.rist_bind = args.rist_bind;
    options.buffer_ms = args.buffer;

    let server = Server::new(options)?;
    let feeder = server.clone();
    tokio::spawn(async move {
        feed_tone(feeder, args.tone).await;
    });

    println!("Serving tone at {} Hz on {}", args.tone, args.bind);
    server.run().await?;
    Ok(())
}

/// Generate 20 ms chunks of a sine tone at wall-clock pace
async fn feed_tone(server: Server, tone_hz: f32) {
    let format = SampleFormat::new(48_000, 16, 2);
    let frames = format.rate() / 50;
    let mut phase = 0.0f32;
    let step = TAU * tone_hz / format.rate() as f32;

    let mut interval = tokio::time::interval(Duration::from_millis(20));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
    loop {
        interval.tick().await;

        let mut payload = Vec::with_capacity(frames as usize * format.frame_size());
        for _ in 0..frames {
            let sample = ((phase.sin() * 0.2) * i16::MAX as f32) as i16;
            phase = (phase + step) % TAU;
            payload.extend_from_slice(&sample.to_le_bytes());
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        let chunk = match PcmChunk::new(format, Tv::default(), Bytes::from(payload)) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("building chunk: {e}");
                return;
            }
        };
        if let Err(e) = server.feed(DEFAULT_STREAM_ID, &chunk) {
            eprintln!("feeding stream: {e}");
            return;
        }
    }
}
