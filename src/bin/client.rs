//! Position Client
//!
//! Connects to the relay server, walks a square path and sends its
//! position every tick. Positions of other players are logged.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duplex_session::{
    config::AppConfig,
    message::MessageKind,
    network,
    position::PositionUpdate,
    protocol::DeliveryType,
    session::ClientSession,
};

/// Side length of the walked square
const PATH_SIDE: i32 = 8;

/// Position after `step` moves around the square
fn walk(step: u64) -> (i32, i32) {
    let side = PATH_SIDE as u64;
    let along = (step % side) as i32;
    match (step / side) % 4 {
        0 => (along, 0),
        1 => (PATH_SIDE, along),
        2 => (PATH_SIDE - along, PATH_SIDE),
        _ => (0, PATH_SIDE - along),
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load_or_default();
    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.session.server_host.clone());
    let port = config.session.server_port;

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = running.clone();
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })?;

    let context = network::initialize();
    let mut client = ClientSession::new(&context, &config)?;
    client
        .connect(&host, port)
        .with_context(|| format!("connecting to {}:{}", host, port))?;

    let me = client.peer_id().unwrap_or_default();
    tracing::info!("Joined as player {}", me);

    let tick = config.session.tick_interval();
    let mut step: u64 = 0;

    while running.load(Ordering::SeqCst) && client.is_connected() {
        let tick_start = Instant::now();

        let (x, y) = walk(step);
        step += 1;
        let update = PositionUpdate::new(me, x, y);
        client.send(DeliveryType::Reliable, update.to_string().as_bytes());

        for message in client.poll() {
            match message.kind() {
                MessageKind::Data => match PositionUpdate::from_payload(message.payload()) {
                    Ok(other) if other.peer_id != me => {
                        tracing::info!("Player {} at ({}, {})", other.peer_id, other.x, other.y);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!("Ignoring {:?}: {}", message.text(), e),
                },
                MessageKind::Disconnect => tracing::warn!("Server closed the connection"),
                MessageKind::Connect => {}
            }
        }

        if let Some(rest) = tick.checked_sub(tick_start.elapsed()) {
            thread::sleep(rest);
        }
    }

    if client.is_connected() {
        tracing::info!("Disconnecting...");
        if let Err(e) = client.disconnect() {
            tracing::warn!("Unclean disconnect: {}", e);
        }
    }

    Ok(())
}
