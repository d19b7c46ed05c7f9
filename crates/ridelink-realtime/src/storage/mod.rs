//! Durable key/value backends for client state.

pub mod file;
pub mod memory;

use std::sync::Arc;

use tracing::info;

use ridelink_core::config::{StorageBackend, StorageConfig};
use ridelink_core::result::AppResult;
use ridelink_core::traits::KeyValueStore;

pub use self::file::FileStore;
pub use self::memory::MemoryStore;

/// Build the configured store.
pub async fn build_store(config: &StorageConfig) -> AppResult<Arc<dyn KeyValueStore>> {
    match config.backend {
        StorageBackend::File => {
            info!(directory = %config.directory, "Using file storage");
            Ok(Arc::new(FileStore::new(&config.directory).await?))
        }
        StorageBackend::Memory => {
            info!("Using in-memory storage");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
