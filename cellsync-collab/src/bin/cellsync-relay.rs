//! Standalone relay server.
//!
//! Usage: `cellsync-relay [BIND_ADDR]`. `RUST_LOG` controls logging.

use cellsync_collab::{RelayServer, ServerConfig};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }
    info!("starting relay on {}", config.bind_addr);

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("relay stopped: {e}");
        std::process::exit(1);
    }
}
