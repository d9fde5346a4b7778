//! Filesystem agent server
//!
//! Exposes filesystem operations to authenticated remote clients over
//! length-prefixed MessagePack frames and streams directory change
//! notifications back to subscribed clients. The transport trusts the
//! `username` carried in each request envelope; authentication happens
//! upstream.

mod connection;
mod handlers;
mod protocol;
mod watcher;

use handlers::ServerState;
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use watcher::WatchMux;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7077";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());

    let watcher = WatchMux::new().map_err(io::Error::other)?;
    let state = Arc::new(ServerState { watcher });

    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("accepted connection from {}", peer);
                tokio::spawn(connection::serve(stream, state.clone()));
            }
            Err(e) => {
                warn!("accept failed: {}", e);
            }
        }
    }
}
