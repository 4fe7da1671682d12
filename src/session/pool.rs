//! Bounded pool of appliance sessions.
//!
//! A fair `tokio::sync::Semaphore` sized to the concurrency limit is the sole
//! admission point, so waiters are served in FIFO order and the number of
//! checked-out sessions never exceeds capacity. Idle sessions are kept for
//! reuse; new ones are opened lazily while under capacity.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::{ApplianceSession, SessionConnector};
use crate::config::PoolConfig;
use crate::error::{DriverError, DriverResult};

type IdleList = Arc<Mutex<Vec<Box<dyn ApplianceSession>>>>;

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub idle: usize,
}

pub struct SessionPool {
    capacity: usize,
    permits: Arc<Semaphore>,
    idle: IdleList,
    in_use: Arc<AtomicUsize>,
    connector: Arc<dyn SessionConnector>,
    config: PoolConfig,
}

impl SessionPool {
    pub fn new(capacity: usize, connector: Arc<dyn SessionConnector>, config: PoolConfig) -> Self {
        let capacity = capacity.max(1);
        info!(capacity, "session pool created");
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Arc::new(Mutex::new(Vec::new())),
            in_use: Arc::new(AtomicUsize::new(0)),
            connector,
            config,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check out a session, waiting in FIFO order for a free slot.
    ///
    /// Fails with `ResourceConflict` when no slot frees up within the acquire
    /// timeout, and with `Connection` when a new session cannot authenticate
    /// within the configured number of attempts or the pool is shut down.
    pub async fn acquire(&self) -> DriverResult<PooledSession> {
        let permit = match tokio::time::timeout(
            self.config.acquire_timeout(),
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DriverError::Connection("session pool is shut down".into())),
            Err(_) => {
                warn!(
                    capacity = self.capacity,
                    timeout_sec = self.config.acquire_timeout_sec,
                    "session pool exhausted"
                );
                return Err(DriverError::ResourceConflict(format!(
                    "session pool exhausted: all {} sessions busy for {}s",
                    self.capacity, self.config.acquire_timeout_sec
                )));
            }
        };

        let reused = self.take_idle();
        let session = match reused {
            Some(session) => session,
            // On failure the permit drops here and the slot is returned.
            None => self.open_session().await?,
        };

        let in_use = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(in_use, capacity = self.capacity, "session checked out");
        Ok(PooledSession {
            session: Some(session),
            permits: self.permits.clone(),
            idle: self.idle.clone(),
            in_use: self.in_use.clone(),
            discard: false,
            _permit: permit,
        })
    }

    /// Close the pool: pending and future `acquire`s fail, idle sessions are closed.
    pub async fn shutdown(&self) {
        // Closed before the idle list is drained; releases check it under the
        // same lock.
        self.permits.close();
        let drained: Vec<_> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let count = drained.len();
        for mut session in drained {
            session.close().await;
        }
        info!(closed = count, "session pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().map(|idle| idle.len()).unwrap_or_default();
        PoolStats {
            capacity: self.capacity,
            in_use: self.in_use.load(Ordering::SeqCst),
            idle,
        }
    }

    fn take_idle(&self) -> Option<Box<dyn ApplianceSession>> {
        let mut idle = self.idle.lock().ok()?;
        while let Some(session) = idle.pop() {
            if session.is_alive() {
                return Some(session);
            }
            debug!("dropping dead idle session");
        }
        None
    }

    async fn open_session(&self) -> DriverResult<Box<dyn ApplianceSession>> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.connector.connect().await {
                Ok(session) => {
                    info!(attempt, "opened new appliance session");
                    return Ok(session);
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "appliance session failed to open");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.connect_retry_delay()).await;
                    }
                }
            }
        }
        let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(DriverError::Connection(format!(
            "could not open appliance session after {attempts} attempts: {cause}"
        )))
    }
}

// ---------------------------------------------------------------------------
// PooledSession
// ---------------------------------------------------------------------------

/// A checked-out session. Dropping it returns the session to the pool (or
/// discards it, see [`PooledSession::discard`]) and frees the slot. Sessions
/// that are not kept are closed in the background.
pub struct PooledSession {
    session: Option<Box<dyn ApplianceSession>>,
    permits: Arc<Semaphore>,
    idle: IdleList,
    in_use: Arc<AtomicUsize>,
    discard: bool,
    // Dropped after `Drop::drop` has put the session back on the idle list.
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("discard", &self.discard)
            .finish_non_exhaustive()
    }
}

impl PooledSession {
    /// Do not return this session to the pool on release.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Deref for PooledSession {
    type Target = dyn ApplianceSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_deref().expect("session present until drop")
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_deref_mut().expect("session present until drop")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        let Some(session) = self.session.take() else {
            return;
        };
        if self.discard || !session.is_alive() {
            debug!("session discarded on release");
            close_in_background(session);
            return;
        }
        match self.idle.lock() {
            Ok(mut idle) if !self.permits.is_closed() => idle.push(session),
            Ok(idle) => {
                drop(idle);
                debug!("pool is shut down, closing released session");
                close_in_background(session);
            }
            Err(_) => close_in_background(session),
        }
    }
}

fn close_in_background(mut session: Box<dyn ApplianceSession>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { session.close().await });
        }
        Err(_) => warn!("no runtime available, dropping session without closing it"),
    }
}
