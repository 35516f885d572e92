use std::sync::{Arc, Mutex};

use ferry_store::{Database, StoreError};

/// The relay database shared between the poller and the HTTP API.
///
/// `rusqlite` is synchronous, so every call runs on the blocking pool.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut db = inner
                .lock()
                .map_err(|_| StoreError::Unavailable("database lock poisoned".into()))?;
            f(&mut db)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}
