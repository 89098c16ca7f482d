//! Per-connection slave session and its lifecycle state.

use std::{fmt, net::IpAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use fleet_core::{OutboundQueue, SessionId, SlaveCallback, SlaveId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{MasterError, Result};

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Connected and pinged within the inactivity timeout.
    Active,
    /// Heartbeat expired or transport closed; awaiting teardown.
    Stale,
    /// Torn down. Terminal.
    Aborted,
}

struct Liveness {
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    inactivity_timeout: Duration,
    aborted: bool,
}

/// One live slave connection.
///
/// Owned by the registry. Liveness fields sit behind a per-session lock so
/// a ping and a sweep racing on the same session stay serialized.
pub struct SlaveSession {
    session_id: SessionId,
    slave_id: SlaveId,
    source_address: IpAddr,
    connected_at: DateTime<Utc>,
    callback: Arc<dyn SlaveCallback>,
    liveness: Mutex<Liveness>,
    outbound: OutboundQueue,
}

impl SlaveSession {
    /// Create a session in the `Active` state.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        slave_id: SlaveId,
        source_address: IpAddr,
        callback: Arc<dyn SlaveCallback>,
        inactivity_timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            slave_id,
            source_address,
            connected_at: now,
            callback,
            liveness: Mutex::new(Liveness {
                last_activity: Instant::now(),
                last_activity_at: now,
                inactivity_timeout,
                aborted: false,
            }),
            outbound: OutboundQueue::new(),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub const fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    #[must_use]
    pub const fn source_address(&self) -> IpAddr {
        self.source_address
    }

    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Transport handle of this session.
    #[must_use]
    pub fn callback(&self) -> &Arc<dyn SlaveCallback> {
        &self.callback
    }

    /// Messages pushed by the slave and not yet consumed.
    #[must_use]
    pub const fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Wall-clock time of the last ping (or of the connect).
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.liveness.lock().last_activity_at
    }

    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        self.liveness.lock().inactivity_timeout
    }

    pub fn set_inactivity_timeout(&self, timeout: Duration) {
        self.liveness.lock().inactivity_timeout = timeout;
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        let (aborted, expired) = {
            let liveness = self.liveness.lock();
            (
                liveness.aborted,
                liveness.last_activity.elapsed() >= liveness.inactivity_timeout,
            )
        };

        if aborted {
            ConnectionState::Aborted
        } else if expired || !self.callback.is_open() {
            ConnectionState::Stale
        } else {
            ConnectionState::Active
        }
    }

    /// Whether the session may receive modules and counts as active.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.connection_state() == ConnectionState::Active
    }

    /// Record a heartbeat.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session was already torn down.
    pub fn ping(&self) -> Result<()> {
        let mut liveness = self.liveness.lock();
        if liveness.aborted {
            return Err(MasterError::SessionNotFound(self.session_id.clone()));
        }
        liveness.last_activity = Instant::now();
        liveness.last_activity_at = Utc::now();
        drop(liveness);

        tracing::trace!(session_id = %self.session_id, "Ping");
        Ok(())
    }

    /// Notify the slave, then close the transport.
    ///
    /// Notification is best effort. Returns `false` if the session was
    /// already torn down.
    pub async fn abort(&self) -> bool {
        if !self.mark_aborted() {
            return false;
        }

        if self.callback.is_open() {
            if let Err(e) = self.callback.abort_connection().await {
                tracing::warn!(session_id = %self.session_id, "Abort notification failed: {e}");
            }
        }
        self.callback.close();

        tracing::info!(
            session_id = %self.session_id,
            slave_id = %self.slave_id,
            source = %self.source_address,
            "Connection aborted"
        );
        true
    }

    /// Close the transport without notifying the slave.
    ///
    /// Used for client-initiated disconnects. Returns `false` if the
    /// session was already torn down.
    pub fn close(&self) -> bool {
        if !self.mark_aborted() {
            return false;
        }
        self.callback.close();

        tracing::info!(
            session_id = %self.session_id,
            slave_id = %self.slave_id,
            "Slave disconnected"
        );
        true
    }

    /// Serializable view of the session.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            slave_id: self.slave_id,
            source_address: self.source_address,
            state: self.connection_state(),
            connected_at: self.connected_at,
            last_activity: self.last_activity(),
            queued_messages: self.outbound.len(),
        }
    }

    fn mark_aborted(&self) -> bool {
        let mut liveness = self.liveness.lock();
        !std::mem::replace(&mut liveness.aborted, true)
    }
}

impl fmt::Debug for SlaveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlaveSession")
            .field("session_id", &self.session_id)
            .field("slave_id", &self.slave_id)
            .field("source_address", &self.source_address)
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

/// Session summary for administrative listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub slave_id: SlaveId,
    pub source_address: IpAddr,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub queued_messages: usize,
}
