//! Reservation lifecycle controller.
//!
//! Every operation locks the reservation's entry for its whole duration, checks
//! the state machine, borrows a session from the pool only while it talks to
//! the appliance, and records the resulting transition. Sessions are always
//! released before an error propagates.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{BoundPorts, LifecycleState, Reservation, ReservationRegistry, TestRunHandle};
use crate::appliance::{self, Command};
use crate::config::TransferConfig;
use crate::error::{DriverError, DriverResult};
use crate::platform::ReservationResources;
use crate::results::{ResultArtifact, ResultsCollector};
use crate::session::{ApplianceSession, SessionPool};
use crate::transfer::{TransferFetcher, TransferRequest};

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// Nothing was running; the appliance was not contacted.
    NotRunning(LifecycleState),
}

/// What cleanup did; `warnings` lists the steps that failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub already_clean: bool,
    pub warnings: Vec<String>,
}

pub struct LifecycleController {
    pool: Arc<SessionPool>,
    fetcher: Arc<TransferFetcher>,
    registry: Arc<ReservationRegistry>,
    resources: Arc<dyn ReservationResources>,
    staging_dir: String,
    fetch_retries: u32,
    retry_delay: Duration,
}

impl LifecycleController {
    pub fn new(
        pool: Arc<SessionPool>,
        fetcher: Arc<TransferFetcher>,
        registry: Arc<ReservationRegistry>,
        resources: Arc<dyn ReservationResources>,
        staging_dir: impl Into<String>,
        transfer: &TransferConfig,
    ) -> Self {
        Self {
            pool,
            fetcher,
            registry,
            resources,
            staging_dir: staging_dir.into(),
            fetch_retries: transfer.fetch_retries,
            retry_delay: transfer.retry_delay(),
        }
    }

    // -----------------------------------------------------------------------
    // load
    // -----------------------------------------------------------------------

    /// Fetch the configuration, import it as a test group and bind ports.
    /// Returns the test group name.
    pub async fn load_configuration(
        &self,
        reservation_id: &str,
        request: &TransferRequest,
        use_reservation_ports: bool,
    ) -> DriverResult<String> {
        let mut reservation = self.registry.lock_or_create(reservation_id).await;
        if !reservation.state.can_load() {
            return Err(DriverError::InvalidState {
                operation: "load configuration",
                state: reservation.state,
            });
        }

        match self.configure(&mut reservation, request, use_reservation_ports).await {
            Ok(group) => {
                reservation.last_error = None;
                reservation.transition(LifecycleState::Configured);
                Ok(group)
            }
            Err(e) => {
                reservation.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn configure(
        &self,
        reservation: &mut Reservation,
        request: &TransferRequest,
        use_reservation_ports: bool,
    ) -> DriverResult<String> {
        let payload = self.fetch_with_retry(request).await?;

        let mut session = self.pool.acquire().await?;
        let result = self
            .push_configuration(&mut *session, reservation, request, payload, use_reservation_ports)
            .await;
        drop(session);
        result
    }

    async fn push_configuration(
        &self,
        session: &mut dyn ApplianceSession,
        reservation: &mut Reservation,
        request: &TransferRequest,
        payload: Bytes,
        use_reservation_ports: bool,
    ) -> DriverResult<String> {
        // Re-load replaces the previous test group and forgets its run.
        reservation.run = None;
        if let Some(previous) = reservation.group.take() {
            if let Err(e) = appliance::execute(session, &Command::DeleteTestGroup { group: &previous }).await {
                warn!(reservation_id = %reservation.id, group = %previous, error = %e, "failed to delete previous test group");
            }
        }

        let group = group_name(&reservation.id);
        let remote_path = format!("{}/{}", self.staging_dir, request.destination());
        session.upload_file(&remote_path, payload).await?;
        appliance::execute(
            session,
            &Command::ImportTestGroup {
                group: &group,
                file: &remote_path,
            },
        )
        .await?;
        reservation.group = Some(group.clone());

        let ports = if use_reservation_ports {
            let ports = self.resources.reserved_ports(&reservation.id).await?;
            if ports.is_empty() {
                return Err(DriverError::ResourceConflict(format!(
                    "reservation {} has no reserved ports",
                    reservation.id
                )));
            }
            BoundPorts::Reservation(ports)
        } else {
            let output = appliance::execute(session, &Command::ListFreeInterfaces).await?;
            let free = appliance::parse_free_interfaces(&output);
            if free.is_empty() {
                return Err(DriverError::ResourceConflict(
                    "no free ports available on the appliance".into(),
                ));
            }
            BoundPorts::Appliance(free)
        };
        reservation.ports = Some(ports.clone());

        let interfaces: Vec<&str> = match &ports {
            BoundPorts::Reservation(ports) => ports.iter().map(|p| p.address.as_str()).collect(),
            BoundPorts::Appliance(ports) => ports.iter().map(String::as_str).collect(),
        };
        for interface in interfaces {
            appliance::execute(
                session,
                &Command::BindInterface {
                    group: &group,
                    interface,
                },
            )
            .await?;
        }

        info!(
            reservation_id = %reservation.id,
            group = %group,
            ports = ports.len(),
            use_reservation_ports,
            "configuration loaded"
        );
        Ok(group)
    }

    /// Fetch, re-attempting only transient failures.
    async fn fetch_with_retry(&self, request: &TransferRequest) -> DriverResult<Bytes> {
        let mut attempt = 0;
        loop {
            match self.fetcher.fetch(request).await {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_transient_fetch() && attempt < self.fetch_retries => {
                    attempt += 1;
                    warn!(uri = %request.redacted(), attempt, error = %e, "retrying configuration fetch");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // start / stop
    // -----------------------------------------------------------------------

    pub async fn start_tests(&self, reservation_id: &str) -> DriverResult<TestRunHandle> {
        let Some(mut reservation) = self.registry.lock(reservation_id).await else {
            return Err(DriverError::InvalidState {
                operation: "start traffic",
                state: LifecycleState::Idle,
            });
        };
        if !reservation.state.can_start() {
            return Err(DriverError::InvalidState {
                operation: "start traffic",
                state: reservation.state,
            });
        }
        let group = configured_group(&reservation)?;

        let mut session = self.pool.acquire().await?;
        let result = appliance::execute(&mut *session, &Command::StartTestGroup { group: &group }).await;
        drop(session);

        match result {
            Ok(_) => {
                let handle = TestRunHandle {
                    group,
                    started_at: Utc::now(),
                };
                reservation.run = Some(handle.clone());
                reservation.transition(LifecycleState::Running);
                info!(reservation_id, group = %handle.group, "traffic started");
                Ok(handle)
            }
            Err(e) => {
                reservation.fail(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn stop_tests(&self, reservation_id: &str) -> DriverResult<StopOutcome> {
        let Some(mut reservation) = self.registry.lock(reservation_id).await else {
            debug!(reservation_id, "unknown reservation, stop is a no-op");
            return Ok(StopOutcome::NotRunning(LifecycleState::Idle));
        };
        match reservation.state {
            LifecycleState::Running => {}
            state @ (LifecycleState::Idle | LifecycleState::Configured | LifecycleState::Stopped) => {
                debug!(reservation_id, %state, "nothing running, stop is a no-op");
                return Ok(StopOutcome::NotRunning(state));
            }
            state => {
                return Err(DriverError::InvalidState {
                    operation: "stop traffic",
                    state,
                })
            }
        }
        let group = configured_group(&reservation)?;

        let mut session = self.pool.acquire().await?;
        let result = appliance::execute(&mut *session, &Command::StopTestGroup { group: &group }).await;
        drop(session);

        match result {
            Ok(_) => {
                reservation.transition(LifecycleState::Stopped);
                info!(reservation_id, group = %group, "traffic stopped");
                Ok(StopOutcome::Stopped)
            }
            Err(e) => {
                reservation.fail(e.to_string());
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // results / cleanup
    // -----------------------------------------------------------------------

    /// Collect statistics for the current run. Leaves the lifecycle state as is.
    pub async fn collect_results(
        &self,
        reservation_id: &str,
        collector: &ResultsCollector,
    ) -> DriverResult<ResultArtifact> {
        let Some(reservation) = self.registry.lock(reservation_id).await else {
            return Err(DriverError::InvalidState {
                operation: "collect results",
                state: LifecycleState::Idle,
            });
        };
        let handle = match (&reservation.run, reservation.state.can_collect()) {
            (Some(handle), true) => handle.clone(),
            _ => {
                return Err(DriverError::InvalidState {
                    operation: "collect results",
                    state: reservation.state,
                })
            }
        };

        let mut session = self.pool.acquire().await?;
        let result = collector.collect(&mut *session, reservation_id, &handle).await;
        drop(session);
        result
    }

    /// Best-effort teardown: stop, delete the test group, release reserved
    /// ports. Every step is attempted; failures are reported, not raised.
    /// The reservation's entry is removed from the registry afterwards.
    pub async fn cleanup(&self, reservation_id: &str) -> DriverResult<CleanupReport> {
        let already_clean = CleanupReport {
            already_clean: true,
            warnings: Vec::new(),
        };
        let Some(mut reservation) = self.registry.lock(reservation_id).await else {
            debug!(reservation_id, "unknown reservation, nothing to clean up");
            return Ok(already_clean);
        };
        if reservation.state == LifecycleState::CleanedUp {
            debug!(reservation_id, "already cleaned up");
            self.registry.retire(&mut reservation).await;
            return Ok(already_clean);
        }

        let mut warnings = Vec::new();
        if let Some(group) = reservation.group.clone() {
            match self.pool.acquire().await {
                Ok(mut session) => {
                    let was_running = reservation.state == LifecycleState::Running
                        || (reservation.state == LifecycleState::Failed && reservation.run.is_some());
                    if was_running {
                        if let Err(e) =
                            appliance::execute(&mut *session, &Command::StopTestGroup { group: &group }).await
                        {
                            warnings.push(format!("stop test group {group}: {e}"));
                        }
                    }
                    if let Err(e) =
                        appliance::execute(&mut *session, &Command::DeleteTestGroup { group: &group }).await
                    {
                        warnings.push(format!("delete test group {group}: {e}"));
                    }
                    drop(session);
                }
                Err(e) => warnings.push(format!("acquire session: {e}")),
            }
        }

        if let Some(BoundPorts::Reservation(ports)) = &reservation.ports {
            if !ports.is_empty() {
                if let Err(e) = self.resources.release_ports(reservation_id, ports).await {
                    warnings.push(format!("release reserved ports: {e}"));
                }
            }
        }

        if warnings.is_empty() {
            info!(reservation_id, "reservation cleaned up");
        } else {
            warn!(
                reservation_id,
                failures = warnings.len(),
                details = %warnings.join("; "),
                "reservation cleaned up with failures"
            );
        }
        reservation.reset();
        self.registry.retire(&mut reservation).await;
        Ok(CleanupReport {
            already_clean: false,
            warnings,
        })
    }
}

fn configured_group(reservation: &Reservation) -> DriverResult<String> {
    reservation.group.clone().ok_or_else(|| DriverError::InvalidState {
        operation: "use test group",
        state: reservation.state,
    })
}

/// Appliance test group name: reservation prefix plus a random suffix.
fn group_name(reservation_id: &str) -> String {
    let prefix: String = reservation_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("tg-{}-{}", prefix, &suffix[..8])
}
