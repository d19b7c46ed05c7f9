//! Durable storage configuration.

use serde::{Deserialize, Serialize};

/// Which [`KeyValueStore`](crate::traits::KeyValueStore) backs the offline queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON files in a local directory.
    File,
    /// Process memory only; nothing survives a restart.
    Memory,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend type.
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// Directory for the file backend.
    #[serde(default = "default_directory")]
    pub directory: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            directory: default_directory(),
        }
    }
}

fn default_backend() -> StorageBackend {
    StorageBackend::File
}

fn default_directory() -> String {
    "./data/ridelink".to_string()
}
