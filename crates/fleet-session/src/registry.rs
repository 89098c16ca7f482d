//! Concurrent registry of live slave sessions.

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use dashmap::DashMap;
use fleet_core::{SessionId, SlaveCallback, SlaveDirectory, SlaveId};
use futures::future::join_all;

use crate::{error::Result, session::SlaveSession};

/// Outcome of a teardown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// This caller removed the session and tore it down.
    Performed,
    /// The session was already gone.
    AlreadyGone,
}

impl Teardown {
    #[must_use]
    pub const fn is_performed(self) -> bool {
        matches!(self, Self::Performed)
    }
}

/// Map of session id to live session, with a source-address index.
///
/// At most one session per source address is registered at any time.
/// Removal is the single linearization point for teardown: whichever
/// caller takes a session out of the map tears it down, every other
/// caller observes it as already gone.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SlaveSession>>,
    by_address: DashMap<IpAddr, SessionId>,
    directory: Arc<dyn SlaveDirectory>,
    timeout_ms: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(directory: Arc<dyn SlaveDirectory>, inactivity_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            by_address: DashMap::new(),
            directory,
            timeout_ms: AtomicU64::new(duration_millis(inactivity_timeout)),
        }
    }

    /// Timeout applied to newly registered sessions.
    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    /// Register a new connection.
    ///
    /// Resolves the durable slave identity through the directory, then
    /// installs the session as [`register`](Self::register) does.
    ///
    /// # Errors
    /// Returns error if the directory lookup fails.
    pub async fn add(
        &self,
        session_id: SessionId,
        source_address: IpAddr,
        callback: Arc<dyn SlaveCallback>,
    ) -> Result<Arc<SlaveSession>> {
        let slave_id = self.resolve_slave(source_address).await?;
        self.register(session_id, source_address, slave_id, callback)
            .await
    }

    /// Durable identity of the slave at `source_address`, registering it
    /// on first contact. Touches no session.
    ///
    /// # Errors
    /// Returns error if the directory lookup fails.
    pub async fn resolve_slave(&self, source_address: IpAddr) -> Result<SlaveId> {
        Ok(self
            .directory
            .resolve_or_register_slave(source_address)
            .await?)
    }

    /// Install a session for an already resolved slave.
    ///
    /// Any session with the same id or the same source address is removed
    /// and aborted first.
    ///
    /// # Errors
    /// Returns error if the connection cannot be recorded; nothing is
    /// installed or displaced in that case.
    pub async fn register(
        &self,
        session_id: SessionId,
        source_address: IpAddr,
        slave_id: SlaveId,
        callback: Arc<dyn SlaveCallback>,
    ) -> Result<Arc<SlaveSession>> {
        self.directory.record_connection(slave_id, Utc::now()).await?;

        let session = Arc::new(SlaveSession::new(
            session_id,
            slave_id,
            source_address,
            callback,
            self.inactivity_timeout(),
        ));

        let displaced = self.install(&session);
        // A broadcast may have run between construction and install.
        session.set_inactivity_timeout(self.inactivity_timeout());

        if !displaced.is_empty() {
            tracing::info!(
                session_id = %session.session_id(),
                source = %source_address,
                displaced = displaced.len(),
                "Kicking existing connections"
            );
            join_all(displaced.iter().map(|old| old.abort())).await;
        }

        tracing::info!(
            session_id = %session.session_id(),
            slave_id = %slave_id,
            source = %source_address,
            "Slave connected"
        );
        Ok(session)
    }

    /// Insert `session`, returning the sessions it displaced.
    fn install(&self, session: &Arc<SlaveSession>) -> Vec<Arc<SlaveSession>> {
        let session_id = session.session_id().to_string();
        let address = session.source_address();
        let mut displaced = Vec::new();

        {
            // The address entry stays locked while both maps are updated,
            // which serializes concurrent adds for one address.
            let mut slot = self
                .by_address
                .entry(address)
                .or_insert_with(|| session_id.clone());
            let previous = std::mem::replace(slot.value_mut(), session_id.clone());

            if previous != session_id {
                if let Some((_, old)) = self.sessions.remove(&previous) {
                    displaced.push(old);
                }
            }
            if let Some(old) = self.sessions.insert(session_id.clone(), Arc::clone(session)) {
                displaced.push(old);
            }
        }

        // A reused session id may still be indexed under its old address.
        for old in &displaced {
            if old.source_address() != address {
                self.by_address
                    .remove_if(&old.source_address(), |_, id| id == old.session_id());
            }
        }

        displaced
    }

    /// Look up a session by id.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<SlaveSession>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    /// Atomically take a session out of the registry.
    ///
    /// Returns `None` if another caller already removed it.
    pub fn remove(&self, session_id: &str) -> Option<Arc<SlaveSession>> {
        let (_, session) = self.sessions.remove(session_id)?;
        self.unindex(&session);
        Some(session)
    }

    /// Remove and abort a session: notify the slave, then close.
    pub async fn abort(&self, session_id: &str) -> Teardown {
        match self.remove(session_id) {
            Some(session) => {
                session.abort().await;
                Teardown::Performed
            }
            None => Teardown::AlreadyGone,
        }
    }

    /// Remove a session and close it without notifying the slave.
    pub fn disconnect(&self, session_id: &str) -> Teardown {
        match self.remove(session_id) {
            Some(session) => {
                session.close();
                Teardown::Performed
            }
            None => Teardown::AlreadyGone,
        }
    }

    /// Abort a session only if it is not ready at the moment of removal.
    ///
    /// A session pinged after the sweep snapshot was taken survives.
    pub async fn evict_stale(&self, session_id: &str) -> Teardown {
        let Some((_, session)) = self.sessions.remove_if(session_id, |_, s| !s.is_ready()) else {
            return Teardown::AlreadyGone;
        };
        self.unindex(&session);
        session.abort().await;
        Teardown::Performed
    }

    /// Point-in-time copy of all registered sessions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<SlaveSession>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// The ready session of a slave, if connected.
    #[must_use]
    pub fn find_ready_by_slave(&self, slave_id: SlaveId) -> Option<Arc<SlaveSession>> {
        self.snapshot()
            .into_iter()
            .find(|s| s.slave_id() == slave_id && s.is_ready())
    }

    /// The session registered for a source address, ready or not.
    #[must_use]
    pub fn find_by_address(&self, address: IpAddr) -> Option<Arc<SlaveSession>> {
        let session_id = self.by_address.get(&address).map(|e| e.value().clone())?;
        self.get(&session_id)
    }

    /// Set the inactivity timeout on every registered session and on
    /// sessions registered afterwards.
    ///
    /// Returns the number of sessions updated.
    pub fn broadcast_timeout(&self, timeout: Duration) -> usize {
        self.timeout_ms
            .store(duration_millis(timeout), Ordering::Release);

        let sessions = self.snapshot();
        for session in &sessions {
            session.set_inactivity_timeout(timeout);
        }

        tracing::debug!(
            timeout_ms = duration_millis(timeout),
            sessions = sessions.len(),
            "Broadcast inactivity timeout"
        );
        sessions.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn unindex(&self, session: &SlaveSession) {
        self.by_address
            .remove_if(&session.source_address(), |_, id| id == session.session_id());
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
