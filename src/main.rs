use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use meshcall::registry::SessionRegistry;
use meshcall::signaling::{DEFAULT_SIGNALING_PORT, ServerConfig, SignalingServer};
use tracing::info;

#[derive(Parser)]
#[command(name = "meshcall", about = "WebSocket signaling relay for mesh video calls")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "MESHCALL_BIND", default_value_t = format!("0.0.0.0:{}", DEFAULT_SIGNALING_PORT))]
    bind: String,

    /// Outbound frames buffered per connection before broadcasts are dropped.
    #[arg(long, default_value_t = 256)]
    queue_depth: usize,

    #[arg(long, default_value_t = 30)]
    ping_interval_secs: u64,

    #[arg(long, default_value_t = 10)]
    pong_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshcall=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        outbound_queue_depth: args.queue_depth.max(1),
        ping_interval: Duration::from_secs(args.ping_interval_secs.max(1)),
        pong_timeout: Duration::from_secs(args.pong_timeout_secs.max(1)),
    };

    let server = SignalingServer::new(config, Arc::new(SessionRegistry::new()));

    info!("Press Ctrl+C to stop");
    tokio::select! {
        result = server.run(&args.bind) => result,
        _ = tokio::signal::ctrl_c() => {
            info!(
                "Shutting down, {} frames dropped on full queues",
                server.hub().dropped_messages()
            );
            Ok(())
        }
    }
}
