//! Offline queue inspection command.

use clap::Args;

use ridelink_core::config::AppConfig;
use ridelink_core::error::AppError;
use ridelink_realtime::outbox::QueuedMessage;
use ridelink_realtime::storage::build_store;

/// Queue command arguments
#[derive(Debug, Args)]
pub struct QueueArgs {
    /// Discard the persisted queue instead of printing it
    #[arg(long)]
    pub clear: bool,
}

/// Print (or clear) the persisted offline queue.
pub async fn execute(args: &QueueArgs, config: &AppConfig) -> Result<(), AppError> {
    let store = build_store(&config.storage).await?;
    let key = &config.channel.queue.storage_key;

    if args.clear {
        store.delete(key).await?;
        println!("✓ Offline queue cleared");
        return Ok(());
    }

    let Some(raw) = store.get(key).await? else {
        println!("Offline queue is empty.");
        return Ok(());
    };

    let entries: Vec<QueuedMessage> = serde_json::from_str(&raw)?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}
