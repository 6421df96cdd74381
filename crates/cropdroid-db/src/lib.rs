//! # CropDroid DB
//!
//! Implementations of the record-store contract and the typed DAO the rest
//! of the control plane talks to. The backend is picked once at process
//! start by [`open_store`]; nothing above this crate branches on it.

pub mod dao;
pub mod history;
pub mod memory;
pub mod replicated;
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use cropdroid_core::config::{CropDroidConfig, DataStoreKind};
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::traits::RecordStore;

pub use dao::{Dao, Page};
pub use history::SqliteDeviceDataStore;
pub use memory::MemoryStore;
pub use replicated::{LocalReplicator, ReplicatedStore};
pub use sqlite::SqliteStore;

/// Expand `~` and env vars in a configured database path.
pub fn resolve_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(raw).map(|s| s.into_owned()).unwrap_or_else(|_| raw.to_string()))
}

/// Build the configured record store.
pub fn open_store(config: &CropDroidConfig) -> Result<Arc<dyn RecordStore>> {
    match config.data_store {
        DataStoreKind::Memory => {
            tracing::info!("🗄️ Using in-memory record store");
            Ok(Arc::new(MemoryStore::new()))
        }
        DataStoreKind::Gorm => {
            let path = resolve_path(&config.database_path);
            tracing::info!("🗄️ Using SQLite record store at {}", path.display());
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
        DataStoreKind::Raft => {
            let path = resolve_path(&config.database_path);
            tracing::info!("🗄️ Using replicated SQLite store at {}", path.display());
            let local: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&path)?);
            Ok(Arc::new(ReplicatedStore::new(
                local,
                Arc::new(LocalReplicator::new()),
            )))
        }
        DataStoreKind::Redis => Err(CropDroidError::Config(
            "data_store 'redis' is not supported by this build".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory_store() {
        let store = open_store(&CropDroidConfig::default()).unwrap();
        assert_eq!(store.backend(), "memory");
    }

    #[test]
    fn test_open_raft_store() {
        let dir = std::env::temp_dir().join(format!("cropdroid-open-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = CropDroidConfig {
            data_store: DataStoreKind::Raft,
            database_path: dir.join("raft.db").display().to_string(),
            ..CropDroidConfig::default()
        };
        let store = open_store(&config).unwrap();
        assert_eq!(store.backend(), "replicated");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_redis_rejected() {
        let config = CropDroidConfig {
            data_store: DataStoreKind::Redis,
            ..CropDroidConfig::default()
        };
        assert!(open_store(&config).is_err());
    }
}
