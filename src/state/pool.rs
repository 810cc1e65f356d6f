use crate::error::{AppError, Result};
use crate::state::RecordStore;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool of store handles.
///
/// Handles are checked out for a single store operation and returned when
/// the guard drops, on every exit path.
#[derive(Clone)]
pub struct StorePool {
    store: Arc<dyn RecordStore>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl StorePool {
    pub fn new(store: Arc<dyn RecordStore>, size: usize) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Wait for a free handle
    pub async fn acquire(&self) -> Result<PooledStore> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Store(format!("Store pool closed: {}", e)))?;

        Ok(PooledStore {
            store: Arc::clone(&self.store),
            _permit: permit,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Handles not currently checked out
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A checked-out store handle; dropping it returns the slot to the pool
pub struct PooledStore {
    store: Arc<dyn RecordStore>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledStore {
    type Target = dyn RecordStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}
