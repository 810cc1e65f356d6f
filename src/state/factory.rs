use crate::error::{AppError, Result};
use crate::state::{InMemoryStore, QuarantineLog, RecordStore, SledStore};
use std::sync::Arc;

/// Record store and quarantine log backed by the same database
#[derive(Clone)]
pub struct StoreHandles {
    pub records: Arc<dyn RecordStore>,
    pub quarantine: Arc<dyn QuarantineLog>,
}

/// Create the stores named by a connection string (`memory://` or `sled://<path>`)
pub fn create_store(url: &str) -> Result<StoreHandles> {
    let url = url.trim();

    if url == "memory://" || url == "memory" {
        return Ok(create_in_memory_store());
    }

    if let Some(path) = url.strip_prefix("sled://") {
        if path.is_empty() {
            return Err(AppError::Configuration(
                "sled store URL requires a path (sled://<path>)".to_string(),
            ));
        }

        tracing::info!(path = %path, "Initializing Sled storage backend");

        let store = Arc::new(SledStore::new(path)?);
        return Ok(StoreHandles {
            records: store.clone(),
            quarantine: store,
        });
    }

    Err(AppError::Configuration(format!(
        "Unsupported store URL '{}' (expected memory:// or sled://<path>)",
        url
    )))
}

/// Create an in-memory store (for testing and development)
pub fn create_in_memory_store() -> StoreHandles {
    tracing::info!("Initializing in-memory storage backend");
    let store = Arc::new(InMemoryStore::new());
    StoreHandles {
        records: store.clone(),
        quarantine: store,
    }
}
