use std::net::SocketAddr;
use std::sync::Arc;

use retroboard::relay::{self, RoomRegistry};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let bind_addr = std::env::var("RELAY_ADDR").unwrap_or_else(|_| "0.0.0.0:4444".to_string());

    let registry = Arc::new(RoomRegistry::new());
    let app = relay::router(registry);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "signaling relay listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
