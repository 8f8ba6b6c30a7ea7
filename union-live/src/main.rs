use log::{error, info};
use std::sync::Arc;

use union_live::{LiveServer, ServerConfig, Store, StoreConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    info!("Starting union live server...");

    let store = match Store::open(StoreConfig::from_env()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open store: {e}");
            std::process::exit(1);
        }
    };

    let server = LiveServer::new(ServerConfig::from_env(), store.clone());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    server.shutdown().await;
    store.close().await;
}
