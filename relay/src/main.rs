use clap::Parser;
use log::info;
use relay::{Relay, RelayConfig};
use shared::DEFAULT_RELAY_PORT;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_RELAY_PORT)]
    port: u16,

    /// Tick events per second (1-1000)
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Maximum concurrent clients
    #[arg(short, long, default_value = "64")]
    max_clients: usize,

    /// Send clients their own events back
    #[arg(short, long)]
    echo: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut relay = Relay::with_config(RelayConfig {
        max_clients: args.max_clients,
        echo_to_sender: args.echo,
        ..RelayConfig::default()
    });

    if !relay.set_tick_rate(args.tick_rate) {
        return Err(format!("tick rate must be between 1 and 1000, got {}", args.tick_rate).into());
    }

    if !relay.activate(args.port) {
        return Err(format!("failed to listen on port {}", args.port).into());
    }

    let mut status = interval(Duration::from_secs(10));
    status.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = status.tick() => {
                info!(
                    "{} clients connected, {} ticks sent",
                    relay.client_count(),
                    relay.ticks_sent()
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    relay.deactivate();
    Ok(())
}
