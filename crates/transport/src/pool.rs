//! Exclusive-session connection pool.
//!
//! A bounded semaphore serializes checkouts at the provider's connection
//! limit. Idle sessions past their timeout are dropped at the next
//! checkout; a session poisoned by a network error or a 5xx response is
//! never returned to the pool.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use common::{MessageId, ServerProfile};

use crate::error::{Result, TransportError};
use crate::session::NntpSession;

struct IdleEntry {
    session: NntpSession,
    since: Instant,
}

struct PoolInner {
    profile: ServerProfile,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleEntry>>,
}

#[derive(Clone)]
pub struct NntpPool {
    inner: Arc<PoolInner>,
}

impl NntpPool {
    pub fn new(profile: ServerProfile) -> Self {
        let permits = profile.max_connections.max(1);
        Self {
            inner: Arc::new(PoolInner {
                profile,
                semaphore: Arc::new(Semaphore::new(permits)),
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn profile(&self) -> &ServerProfile {
        &self.inner.profile
    }

    /// Acquire an exclusive session, reusing a fresh idle one when
    /// available. Blocks when all permits are handed out.
    pub async fn checkout(&self) -> Result<PooledSession> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore closed");

        let reused = {
            let mut idle = self.inner.idle.lock().expect("pool idle mutex poisoned");
            let timeout = self.inner.profile.idle_timeout();
            // Stale sessions are dropped here, which closes them.
            idle.retain(|entry| entry.since.elapsed() < timeout);
            idle.pop().map(|entry| entry.session)
        };

        let session = match reused {
            Some(session) => {
                debug!("reusing pooled session");
                session
            }
            None => NntpSession::connect(&self.inner.profile).await?,
        };

        Ok(PooledSession {
            session: Some(session),
            poisoned: false,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }
}

/// Whether an error means the session state is unusable.
fn poisons(err: &TransportError) -> bool {
    match err {
        TransportError::Io(_)
        | TransportError::Tls(_)
        | TransportError::Timeout { .. }
        | TransportError::ConnectionClosed
        | TransportError::Protocol(_) => true,
        TransportError::Status { code, .. } => *code >= 500,
        _ => false,
    }
}

/// Exclusive session checked out of the pool. Returned on drop unless an
/// operation poisoned it.
pub struct PooledSession {
    session: Option<NntpSession>,
    poisoned: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    fn session(&mut self) -> &mut NntpSession {
        self.session.as_mut().expect("session taken")
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if poisons(err) {
                warn!(%err, "session poisoned");
                self.poisoned = true;
            }
        }
        result
    }

    pub async fn select_group(&mut self, name: &str) -> Result<()> {
        let result = self.session().select_group(name).await;
        self.track(result)
    }

    pub async fn post(
        &mut self,
        subject: &str,
        extra_headers: &[(&str, String)],
        body: &[u8],
    ) -> Result<MessageId> {
        let result = self.session().post(subject, extra_headers, body).await;
        self.track(result)
    }

    pub async fn fetch(&mut self, message_id: &MessageId) -> Result<Vec<u8>> {
        let result = self.session().fetch(message_id).await;
        self.track(result)
    }

    pub async fn exists(&mut self, message_id: &MessageId) -> Result<bool> {
        let result = self.session().exists(message_id).await;
        self.track(result)
    }

    /// Force-discard this session regardless of operation outcomes.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if self.poisoned {
            return;
        }
        if let Some(session) = self.session.take() {
            let mut idle = self.pool.idle.lock().expect("pool idle mutex poisoned");
            idle.push(IdleEntry {
                session,
                since: Instant::now(),
            });
        }
    }
}
