//! Position Relay Server
//!
//! Accepts game clients and relays every position update to all of them.

use anyhow::Result;
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
    session::ServerSession,
};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting position relay server v{}", duplex_session::VERSION);

    let config = AppConfig::load_or_default();

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = running.clone();
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })?;

    let context = network::initialize();
    let mut server = ServerSession::new(&context, &config);
    server.start(config.network.port)?;

    let tick = config.session.tick_interval();
    let mut relayed: u64 = 0;
    let mut last_report = Instant::now();

    while running.load(Ordering::SeqCst) {
        let tick_start = Instant::now();

        for message in server.poll() {
            match message.kind() {
                MessageKind::Connect => {
                    tracing::info!("Player {} joined ({} online)", message.peer_id(), server.num_clients());
                }
                MessageKind::Disconnect => {
                    tracing::info!("Player {} left ({} online)", message.peer_id(), server.num_clients());
                }
                MessageKind::Data => match PositionUpdate::from_payload(message.payload()) {
                    Ok(update) => {
                        tracing::debug!("Player {} at ({}, {})", update.peer_id, update.x, update.y);
                        server.broadcast(DeliveryType::Reliable, update.to_string().as_bytes());
                        relayed += 1;
                    }
                    Err(e) => {
                        tracing::debug!("Peer {} sent {:?}: {}", message.peer_id(), message.text(), e);
                    }
                },
            }
        }

        if last_report.elapsed().as_secs() >= 10 {
            tracing::info!("{} client(s), {} update(s) relayed", server.num_clients(), relayed);
            last_report = Instant::now();
        }

        if let Some(rest) = tick.checked_sub(tick_start.elapsed()) {
            thread::sleep(rest);
        }
    }

    tracing::info!("Shutting down...");
    if let Err(e) = server.stop() {
        tracing::warn!("Unclean shutdown: {}", e);
    }

    Ok(())
}
