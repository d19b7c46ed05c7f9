//! Listen command: keep a channel open and log what it sees.

use std::sync::Arc;

use clap::Args;
use tracing::info;

use ridelink_core::config::AppConfig;
use ridelink_core::error::{AppError, ErrorKind};
use ridelink_realtime::storage::build_store;
use ridelink_realtime::transport::WsTransport;
use ridelink_realtime::{ChannelEvent, EventKind, RealtimeClient};

/// Listen command arguments
#[derive(Debug, Args)]
pub struct ListenArgs {
    /// Bearer token presented on connect
    #[arg(short, long)]
    pub token: String,

    /// Ride to join after connecting (repeatable)
    #[arg(long = "ride")]
    pub rides: Vec<String>,

    /// User whose presence to follow (repeatable)
    #[arg(long = "presence")]
    pub presence: Vec<String>,
}

/// Connect, log until Ctrl-C, then disconnect cleanly.
pub async fn execute(args: &ListenArgs, config: AppConfig) -> Result<(), AppError> {
    info!("Starting RideLink v{}", env!("CARGO_PKG_VERSION"));

    let store = build_store(&config.storage).await?;
    let client = RealtimeClient::new(config.channel, Arc::new(WsTransport::new()), store).await?;

    for kind in EventKind::ALL {
        client.on(kind, log_event);
    }

    client.subscribe_presence(args.presence.iter().cloned()).await?;
    client.connect(args.token.clone()).await?;
    for ride in &args.rides {
        client.join_ride(ride.clone()).await?;
    }

    tokio::signal::ctrl_c().await.map_err(|e| {
        AppError::with_source(ErrorKind::Internal, "Failed to listen for Ctrl-C", e)
    })?;

    info!("Shutting down");
    client.close().await;
    Ok(())
}

fn log_event(event: &ChannelEvent) {
    match event {
        ChannelEvent::Inbound(inbound) => {
            info!(event = inbound.name(), payload = ?inbound, "Inbound event");
        }
        ChannelEvent::Signal(signal) => {
            info!(signal = %signal.kind(), detail = ?signal, "Channel signal");
        }
    }
}
