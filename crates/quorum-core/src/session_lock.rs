use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-session async locks. Concurrent requests against the same session
/// queue in arrival order (tokio mutexes are FIFO-fair); requests against
/// different sessions never contend.
#[derive(Default)]
pub struct SessionLockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
