//! Orchestration facade: the entry points the platform invokes, one per
//! reservation lifecycle step.
//!
//! Each command runs inside an [`OperationScope`] that logs its start and end,
//! logs the full error on failure, and hands the caller a single wrapped
//! message. Collaborators are assembled per call from the command context.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::config::DriverConfig;
use crate::context::{parse_sessions_limit, CommandContext, ResourceConfig};
use crate::error::{DriverError, DriverResult};
use crate::platform::{Platform, ScopedToken};
use crate::reservation::{LifecycleController, ReservationRegistry, StopOutcome};
use crate::results::{ResultArtifact, ResultsCollector};
use crate::session::{PoolStats, SessionPool};
use crate::transfer::{TransferFetcher, TransferRequest};

/// Coarse classification of a failed command, for callers that map failures
/// onto their own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationErrorKind {
    /// Bad input or the driver was never initialized.
    Invalid,
    /// Out-of-order lifecycle call or no resources left.
    Conflict,
    /// The appliance, the config server or the platform failed.
    Upstream,
    Timeout,
}

impl From<&DriverError> for OperationErrorKind {
    fn from(err: &DriverError) -> Self {
        match err {
            DriverError::Config(_) => OperationErrorKind::Invalid,
            DriverError::InvalidState { .. } | DriverError::ResourceConflict(_) => {
                OperationErrorKind::Conflict
            }
            DriverError::Timeout(_) => OperationErrorKind::Timeout,
            DriverError::Connection(_)
            | DriverError::RemoteFetch { .. }
            | DriverError::ApplianceCommand { .. }
            | DriverError::ManagementApi(_) => OperationErrorKind::Upstream,
        }
    }
}

/// The single message surfaced to the caller when a command fails.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed: {message}")]
pub struct OperationError {
    pub operation: &'static str,
    pub kind: OperationErrorKind,
    pub message: String,
}

// ---------------------------------------------------------------------------
// OperationScope
// ---------------------------------------------------------------------------

/// Logging and error-normalization context around one command.
struct OperationScope {
    name: &'static str,
    span: Span,
    started: Instant,
    finished: bool,
}

impl OperationScope {
    fn enter(name: &'static str, reservation_id: Option<&str>) -> Self {
        let span = info_span!("operation", op = name, reservation_id = reservation_id.unwrap_or("-"));
        span.in_scope(|| info!("{name} command started"));
        Self {
            name,
            span,
            started: Instant::now(),
            finished: false,
        }
    }

    async fn run<T, F>(mut self, fut: F) -> Result<T, OperationError>
    where
        F: Future<Output = DriverResult<T>>,
    {
        let result = fut.instrument(self.span.clone()).await;
        self.finished = true;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let _entered = self.span.enter();
        match result {
            Ok(value) => {
                info!(elapsed_ms, "{} command ended", self.name);
                Ok(value)
            }
            Err(e) => {
                error!(elapsed_ms, error = ?e, "{} command failed: {e}", self.name);
                Err(OperationError {
                    operation: self.name,
                    kind: OperationErrorKind::from(&e),
                    message: e.to_string(),
                })
            }
        }
    }
}

impl Drop for OperationScope {
    fn drop(&mut self) {
        if !self.finished {
            let _entered = self.span.enter();
            warn!("{} command aborted before completion", self.name);
        }
    }
}

// ---------------------------------------------------------------------------
// TrafficControllerDriver
// ---------------------------------------------------------------------------

pub struct TrafficControllerDriver {
    config: DriverConfig,
    platform: Arc<dyn Platform>,
    fetcher: Arc<TransferFetcher>,
    registry: Arc<ReservationRegistry>,
    pool: RwLock<Option<Arc<SessionPool>>>,
}

impl TrafficControllerDriver {
    pub fn new(config: DriverConfig, platform: Arc<dyn Platform>) -> DriverResult<Self> {
        let fetcher = TransferFetcher::new(&config.transfer)?;
        Ok(Self::with_fetcher(config, platform, fetcher))
    }

    /// Driver with a caller-supplied transfer dispatch table.
    pub fn with_fetcher(config: DriverConfig, platform: Arc<dyn Platform>, fetcher: TransferFetcher) -> Self {
        Self {
            config,
            platform,
            fetcher: Arc::new(fetcher),
            registry: Arc::new(ReservationRegistry::new()),
            pool: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ReservationRegistry> {
        &self.registry
    }

    pub async fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.read().await.as_ref().map(|pool| pool.stats())
    }

    /// Create the session pool sized by the resource's concurrency limit.
    pub async fn initialize(&self, ctx: &CommandContext) -> Result<String, OperationError> {
        OperationScope::enter("initialize", None)
            .run(async {
                let limit = parse_sessions_limit(ctx)?;
                let decryptor = self.platform.decryptor(ctx)?;
                let resource = ResourceConfig::resolve(ctx, decryptor.as_ref()).await?;
                let connector = self.platform.connector(resource.clone(), &self.config);
                let pool = Arc::new(SessionPool::new(limit, connector, self.config.pool.clone()));

                let previous = self.pool.write().await.replace(pool);
                if let Some(previous) = previous {
                    previous.shutdown().await;
                }
                info!(address = %resource.address, sessions = limit, "driver initialized");
                Ok("Finished initializing".to_string())
            })
            .await
    }

    pub async fn load_config(
        &self,
        ctx: &CommandContext,
        config_file_location: &str,
        use_ports_from_reservation: &str,
    ) -> Result<String, OperationError> {
        let use_reservation_ports = use_ports_from_reservation.trim().eq_ignore_ascii_case("true");
        OperationScope::enter("load configuration", ctx.reservation_id().ok())
            .run(async {
                let reservation_id = ctx.reservation_id()?;
                let controller = self.controller(ctx).await?;
                let request = TransferRequest::parse(config_file_location)?;
                let group = controller
                    .load_configuration(reservation_id, &request, use_reservation_ports)
                    .await?;
                Ok(format!(
                    "Configuration {} loaded as test group {group}",
                    request.redacted()
                ))
            })
            .await
    }

    pub async fn start_traffic(&self, ctx: &CommandContext) -> Result<String, OperationError> {
        OperationScope::enter("start traffic", ctx.reservation_id().ok())
            .run(async {
                let reservation_id = ctx.reservation_id()?;
                let handle = self.controller(ctx).await?.start_tests(reservation_id).await?;
                Ok(format!("Traffic started for test group {}", handle.group))
            })
            .await
    }

    pub async fn stop_traffic(&self, ctx: &CommandContext) -> Result<String, OperationError> {
        OperationScope::enter("stop traffic", ctx.reservation_id().ok())
            .run(async {
                let reservation_id = ctx.reservation_id()?;
                let outcome = self.controller(ctx).await?.stop_tests(reservation_id).await?;
                Ok(match outcome {
                    StopOutcome::Stopped => "Traffic stopped".to_string(),
                    StopOutcome::NotRunning(state) => {
                        format!("No traffic running (reservation is {state})")
                    }
                })
            })
            .await
    }

    pub async fn get_statistics(&self, ctx: &CommandContext) -> Result<ResultArtifact, OperationError> {
        OperationScope::enter("get statistics", ctx.reservation_id().ok())
            .run(async {
                let reservation_id = ctx.reservation_id()?;
                let controller = self.controller(ctx).await?;
                let uploader = Arc::new(ScopedToken::new(self.platform.management(ctx)?));
                let collector = ResultsCollector::new(self.config.results.clone(), Some(uploader));
                controller.collect_results(reservation_id, &collector).await
            })
            .await
    }

    pub async fn cleanup_reservation(&self, ctx: &CommandContext) -> Result<String, OperationError> {
        OperationScope::enter("cleanup reservation", ctx.reservation_id().ok())
            .run(async {
                let reservation_id = ctx.reservation_id()?;
                let report = self.controller(ctx).await?.cleanup(reservation_id).await?;
                Ok(if report.already_clean {
                    "Reservation already cleaned up".to_string()
                } else if report.warnings.is_empty() {
                    "Reservation cleaned up".to_string()
                } else {
                    format!(
                        "Reservation cleaned up with {} warning(s): {}",
                        report.warnings.len(),
                        report.warnings.join("; ")
                    )
                })
            })
            .await
    }

    /// Driver teardown: close the session pool.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.shutdown().await;
        }
    }

    async fn controller(&self, ctx: &CommandContext) -> DriverResult<LifecycleController> {
        let pool = self
            .pool
            .read()
            .await
            .clone()
            .ok_or_else(|| DriverError::Config("driver is not initialized".into()))?;
        let decryptor = self.platform.decryptor(ctx)?;
        let resource = ResourceConfig::resolve(ctx, decryptor.as_ref()).await?;
        Ok(LifecycleController::new(
            pool,
            self.fetcher.clone(),
            self.registry.clone(),
            self.platform.resources(ctx)?,
            resource.test_files_location.clone(),
            &self.config.transfer,
        ))
    }
}
