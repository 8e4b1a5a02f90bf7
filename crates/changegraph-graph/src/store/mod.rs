//! Graph Store implementations.

pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use memory::MemoryGraphStore;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksDbGraphStore;

use changegraph_core::{ChangeGraphError, ConfigError, GraphStore, Result, StoreConfig};
use std::sync::Arc;
use tracing::info;

/// Build the store selected by `config.backend`.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn GraphStore>> {
    match config.backend.as_str() {
        "memory" => {
            info!("using in-memory graph store");
            Ok(Arc::new(MemoryGraphStore::new()))
        }
        #[cfg(feature = "rocksdb")]
        "rocksdb" => {
            info!(path = %config.path.display(), "opening rocksdb graph store");
            Ok(Arc::new(RocksDbGraphStore::open(&config.path)?))
        }
        #[cfg(not(feature = "rocksdb"))]
        "rocksdb" => Err(ChangeGraphError::Config(ConfigError::ValidationError(
            "rocksdb backend requires the `rocksdb` feature".to_string(),
        ))),
        other => Err(ChangeGraphError::Config(ConfigError::ValidationError(format!(
            "unknown store backend: {}",
            other
        )))),
    }
}
