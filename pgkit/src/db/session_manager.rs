// Keyed registry of sessions, one per correlation key (usually a request id)

use crate::db::client::DatabaseClient;
use crate::db::session::Session;
use crate::errors::DatabaseError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// A session shared between the holders of one key. Lock it for each unit of work.
pub type SharedSession = Arc<Mutex<Session>>;

pub struct SessionManager {
    client: DatabaseClient,
    sessions: Mutex<HashMap<String, SharedSession>>,
}

impl SessionManager {
    pub fn new(client: DatabaseClient) -> Self {
        Self {
            client,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The live session for `key`, opening one if there is none.
    /// Concurrent callers with the same key always end up with the same session.
    #[instrument(skip(self))]
    pub async fn get_session(&self, key: &str) -> Result<SharedSession, DatabaseError> {
        if let Some(existing) = self.sessions.lock().await.get(key) {
            return Ok(existing.clone());
        }

        // Open outside the map lock so other keys are not held up by a slow acquire
        let opened = self.client.session().await?;

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(key) {
            let existing = existing.clone();
            drop(sessions);
            debug!("Lost the race to open a session; closing the extra one");
            let mut extra = opened;
            if let Err(e) = extra.close().await {
                warn!(error = %e, "Failed to close surplus session");
            }
            return Ok(existing);
        }

        let session = Arc::new(Mutex::new(opened));
        sessions.insert(key.to_string(), session.clone());
        debug!(sessions = sessions.len(), "Session registered");
        Ok(session)
    }

    /// Close and forget the session for `key`. Unknown keys are a no-op.
    #[instrument(skip(self))]
    pub async fn close_session(&self, key: &str) -> Result<(), DatabaseError> {
        let removed = self.sessions.lock().await.remove(key);
        match removed {
            Some(session) => session.lock().await.close().await,
            None => Ok(()),
        }
    }

    /// Close every registered session. All are attempted; the first error is returned.
    #[instrument(skip(self))]
    pub async fn close_all(&self) -> Result<(), DatabaseError> {
        let drained: Vec<(String, SharedSession)> = self.sessions.lock().await.drain().collect();
        let mut first_error = None;
        for (key, session) in drained {
            if let Err(e) = session.lock().await.close().await {
                warn!(key = %key, error = %e, "Failed to close session");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Registered keys, sorted
    pub async fn list_sessions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::PoolOptions;
    use crate::test_support::ScriptedManager;
    use std::time::Duration;

    async fn manager_with(max: usize) -> (ScriptedManager, SessionManager) {
        let scripted = ScriptedManager::new();
        let client = DatabaseClient::with_manager(
            scripted.clone().into_dyn(),
            PoolOptions {
                min_size: 0,
                max_size: max,
                acquire_timeout: Some(Duration::from_millis(200)),
            },
        )
        .await
        .unwrap();
        (scripted, SessionManager::new(client))
    }

    #[tokio::test]
    async fn test_same_key_returns_same_session() {
        let (_scripted, manager) = manager_with(4).await;

        let a = manager.get_session("req-1").await.unwrap();
        let b = manager.get_session("req-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = manager.get_session("req-2").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(manager.session_count().await, 2);
        assert_eq!(manager.list_sessions().await, vec!["req-1", "req-2"]);
    }

    #[tokio::test]
    async fn test_concurrent_get_session_yields_one_session() {
        let (_scripted, manager) = manager_with(4).await;
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_session("shared").await.unwrap() })
            })
            .collect();

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(manager.session_count().await, 1);

        // Surplus sessions gave their connections back
        assert_eq!(manager.client.pool_info().in_use, 1);
    }

    #[tokio::test]
    async fn test_close_session_returns_connection() {
        let (_scripted, manager) = manager_with(1).await;

        let session = manager.get_session("req-1").await.unwrap();
        session.lock().await.execute("SELECT 1", &[]).await.unwrap();
        manager.close_session("req-1").await.unwrap();

        assert_eq!(manager.session_count().await, 0);
        assert!(!session.lock().await.is_open());
        assert_eq!(manager.client.pool_info().idle, 1);

        // Unknown keys are ignored
        manager.close_session("req-1").await.unwrap();
        manager.close_session("never-opened").await.unwrap();
    }

    #[tokio::test]
    async fn test_close_all() {
        let (_scripted, manager) = manager_with(3).await;
        for key in ["a", "b", "c"] {
            manager.get_session(key).await.unwrap();
        }
        assert_eq!(manager.client.pool_info().in_use, 3);

        manager.close_all().await.unwrap();
        assert_eq!(manager.session_count().await, 0);
        assert_eq!(manager.client.pool_info().in_use, 0);
    }
}
