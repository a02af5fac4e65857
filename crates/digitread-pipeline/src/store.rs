//! Persistence for trained model weights.

use std::collections::HashMap;
use std::sync::Mutex;

/// Key under which the digit classifier is persisted.
pub const MODEL_KEY: &str = "digit-classifier-v1";

/// Errors from a [`ModelStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing storage failed.
    #[error("model store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The key cannot be used by this store.
    #[error("invalid model key {0:?}")]
    InvalidKey(String),

    /// The store's internal state is unusable.
    #[error("model store is unavailable: {0}")]
    Unavailable(String),
}

/// Keyed byte storage for serialized models.
pub trait ModelStore: Send + Sync {
    /// Read the bytes stored under `key`, or `None` if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the storage cannot be read.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `bytes` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the storage cannot be written.
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// A [`ModelStore`] that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryModelStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryModelStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelStore for MemoryModelStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        entries.insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }
}
