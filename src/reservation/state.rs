//! Per-reservation state machine and the process-wide registry holding it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::platform::ReservedPort;

// ---------------------------------------------------------------------------
// LifecycleState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Configured,
    Running,
    Stopped,
    CleanedUp,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Configured => "configured",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
            LifecycleState::CleanedUp => "cleaned up",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl LifecycleState {
    /// States from which a configuration may be (re)loaded. `Failed` is
    /// terminal until cleanup.
    pub fn can_load(self) -> bool {
        matches!(
            self,
            LifecycleState::Idle | LifecycleState::Configured | LifecycleState::CleanedUp
        )
    }

    pub fn can_start(self) -> bool {
        self == LifecycleState::Configured
    }

    pub fn can_collect(self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Stopped)
    }
}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

/// Appliance-side identifier of a started test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRunHandle {
    pub group: String,
    pub started_at: DateTime<Utc>,
}

/// Where the ports bound to a test group came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "ports", rename_all = "snake_case")]
pub enum BoundPorts {
    /// Allocated by the platform to the reservation; released on cleanup.
    Reservation(Vec<ReservedPort>),
    /// Discovered free on the appliance; freed with the test group.
    Appliance(Vec<String>),
}

impl BoundPorts {
    pub fn len(&self) -> usize {
        match self {
            BoundPorts::Reservation(ports) => ports.len(),
            BoundPorts::Appliance(ports) => ports.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub id: String,
    pub state: LifecycleState,
    /// Test group imported on the appliance, once configured.
    pub group: Option<String>,
    pub ports: Option<BoundPorts>,
    pub run: Option<TestRunHandle>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Set once cleanup has removed the entry from the registry.
    #[serde(skip)]
    retired: bool,
}

impl Reservation {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: LifecycleState::Idle,
            group: None,
            ports: None,
            run: None,
            last_error: None,
            updated_at: Utc::now(),
            retired: false,
        }
    }

    pub fn transition(&mut self, next: LifecycleState) {
        debug!(reservation_id = %self.id, from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, reason: String) {
        self.last_error = Some(reason);
        self.transition(LifecycleState::Failed);
    }

    /// Drop everything bound to the reservation and mark it cleaned up.
    pub fn reset(&mut self) {
        self.group = None;
        self.ports = None;
        self.run = None;
        self.last_error = None;
        self.transition(LifecycleState::CleanedUp);
    }
}

// ---------------------------------------------------------------------------
// ReservationRegistry
// ---------------------------------------------------------------------------

/// Process-wide map of reservation id to its state machine.
///
/// Each entry sits behind its own async mutex; holding it for the length of
/// an operation serializes operations on one reservation in arrival order.
#[derive(Default)]
pub struct ReservationRegistry {
    entries: RwLock<HashMap<String, Arc<Mutex<Reservation>>>>,
}

impl ReservationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for `id`, created in `Idle` on first use.
    pub async fn entry(&self, id: &str) -> Arc<Mutex<Reservation>> {
        if let Some(entry) = self.entries.read().await.get(id) {
            return entry.clone();
        }
        self.entries
            .write()
            .await
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Reservation::new(id))))
            .clone()
    }

    /// Lock the live entry for `id`, creating it in `Idle` if missing.
    pub async fn lock_or_create(&self, id: &str) -> OwnedMutexGuard<Reservation> {
        loop {
            let reservation = self.entry(id).await.lock_owned().await;
            if !reservation.retired {
                return reservation;
            }
        }
    }

    /// Lock the live entry for `id` without creating one.
    pub async fn lock(&self, id: &str) -> Option<OwnedMutexGuard<Reservation>> {
        loop {
            let entry = self.entries.read().await.get(id).cloned()?;
            let reservation = entry.lock_owned().await;
            if !reservation.retired {
                return Some(reservation);
            }
        }
    }

    /// Drop the locked entry from the map. Operations already queued on its
    /// mutex see it retired and look the id up again.
    pub async fn retire(&self, reservation: &mut Reservation) {
        reservation.retired = true;
        // The lock is held, so the map still points at this entry.
        self.entries.write().await.remove(&reservation.id);
        debug!(reservation_id = %reservation.id, "reservation entry removed");
    }

    /// Current state of `id`, waiting for any in-flight operation on it.
    pub async fn snapshot(&self, id: &str) -> Option<Reservation> {
        let reservation = self.lock(id).await?;
        Some((*reservation).clone())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
