use clap::Parser;
use client::Client;
use log::{info, warn};
use shared::{Event, EventType, DEFAULT_RELAY_PORT};
use std::net::Ipv4Addr;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay IPv4 address
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: Ipv4Addr,

    /// Relay port
    #[arg(short, long, default_value_t = DEFAULT_RELAY_PORT)]
    port: u16,

    /// Frames to run before leaving (0 runs until Ctrl+C)
    #[arg(short, long, default_value = "0")]
    frames: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut client = Client::new();
    if !client.connect(args.host, args.port) {
        return Err(format!("could not reach relay at {}:{}", args.host, args.port).into());
    }

    client.send(&mut Event::with_type(EventType::PlayerJoin));
    client.request_uuid();

    // Roughly 60 frames per second
    let mut frame_timer = interval(Duration::from_millis(16));
    frame_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut frame = 0u64;

    loop {
        tokio::select! {
            _ = frame_timer.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving");
                break;
            }
        }

        while let Some(event) = client.recv() {
            match event.event_type() {
                Some(EventType::Tick) => {}
                Some(kind) => info!("{:?} ({} bytes)", kind, event.size()),
                None => warn!("Event with unknown type {}", event.raw_type()),
            }
        }

        if !client.connected() {
            warn!("Relay closed the connection");
            return Ok(());
        }

        frame += 1;
        if frame % 60 == 0 {
            info!(
                "uuid {:?}, {} ticks, interval {:?}, tween {:.2}",
                client.uuid(),
                client.ticks_received(),
                client.last_tick_interval(),
                client.tween()
            );
        }
        if args.frames > 0 && frame >= args.frames {
            break;
        }
    }

    client.send(&mut Event::with_type(EventType::PlayerLeave));
    client.disconnect();
    Ok(())
}
