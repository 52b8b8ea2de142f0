//! Relay hub server binary.
//!
//! Fans out document operations and presence between all sessions attached to
//! the same document. Configuration comes from the environment: `HOST` and
//! `PORT` for the bind address, `DOC_SYNC_DATA` to enable on-disk persistence
//! of merged room state.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use doc_sync::server::{RelayHub, create_router};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("PORT").unwrap_or_else(|_| "1234".to_string());
    let addr = format!("{host}:{port}");

    let mut hub = RelayHub::new();
    if let Ok(data_dir) = std::env::var("DOC_SYNC_DATA") {
        info!(dir = %data_dir, "persisting room state");
        hub = hub.with_persistence(data_dir);
    }
    let hub = Arc::new(hub);

    // Presence entries expire by explicit sweep, not implicit timers.
    let sweeper = hub.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tick.tick().await;
            sweeper.sweep_presence();
        }
    });

    let app = create_router(hub);

    info!("relay hub listening on ws://{addr}/ws/{{doc_id}}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");
    axum::serve(listener, app)
        .await
        .expect("server terminated");
}
