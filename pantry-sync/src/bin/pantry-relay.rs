//! Standalone signaling relay.
//!
//! Usage: `pantry-relay [bind_addr]`, or set `PANTRY_RELAY_ADDR`.
//! Defaults to `127.0.0.1:9191`.

use pantry_sync::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let bind_addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PANTRY_RELAY_ADDR").ok())
        .unwrap_or_else(|| RelayConfig::default().bind_addr);

    log::info!("Starting pantry relay on {bind_addr}...");
    let server = RelayServer::new(RelayConfig { bind_addr });
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
