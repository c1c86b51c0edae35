use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::models::SessionContext;

/// Sessions expire after 60 minutes of inactivity.
pub const SESSION_TTL: Duration = Duration::from_secs(3600);

/// Cache key for a session.
pub fn session_key(session_id: &str) -> String {
    format!("aesop:session:{session_id}")
}

/// Short-lived per-session cache. Every write resets the TTL.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> anyhow::Result<Option<SessionContext>>;
    async fn put(&self, context: &SessionContext) -> anyhow::Result<()>;
    /// Reset the TTL without touching the content. Returns false when the
    /// session does not exist (or has already expired).
    async fn touch(&self, session_id: &str) -> anyhow::Result<bool>;
    /// Returns true when a live session was removed. Idempotent.
    async fn delete(&self, session_id: &str) -> anyhow::Result<bool>;
}

/// In-process session cache.
///
/// Values are stored as serialized JSON under the same key format a shared
/// cache deployment would use, so swapping the backend never changes the
/// wire representation.
pub struct InMemorySessionStore {
    entries: DashMap<String, (String, Instant)>,
    ttl: Duration,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_ttl(SESSION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.ttl
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> anyhow::Result<Option<SessionContext>> {
        let key = session_key(session_id);

        let payload = match self.entries.get(&key) {
            Some(entry) => {
                let (payload, deadline) = entry.value();
                if *deadline <= Instant::now() {
                    drop(entry);
                    self.entries.remove(&key);
                    debug!(session_id, "session expired");
                    return Ok(None);
                }
                payload.clone()
            }
            None => return Ok(None),
        };

        match serde_json::from_str::<SessionContext>(&payload) {
            Ok(context) => Ok(Some(context)),
            Err(e) => {
                // A cache entry we cannot read is as good as gone
                warn!(session_id, error = %e, "dropping unreadable session payload");
                self.entries.remove(&key);
                Ok(None)
            }
        }
    }

    async fn put(&self, context: &SessionContext) -> anyhow::Result<()> {
        let payload = serde_json::to_string(context)?;
        self.entries.insert(
            session_key(&context.session_id),
            (payload, self.deadline()),
        );
        Ok(())
    }

    async fn touch(&self, session_id: &str) -> anyhow::Result<bool> {
        let key = session_key(session_id);
        match self.entries.get_mut(&key) {
            Some(mut entry) => {
                if entry.value().1 <= Instant::now() {
                    drop(entry);
                    self.entries.remove(&key);
                    return Ok(false);
                }
                entry.value_mut().1 = self.deadline();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, session_id: &str) -> anyhow::Result<bool> {
        Ok(self.entries.remove(&session_key(session_id)).is_some())
    }
}
