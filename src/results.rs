//! Results collection: bounded status polling, statistics export and
//! artifact upload through the management API.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::appliance::{self, Command, GroupState};
use crate::config::ResultsConfig;
use crate::error::DriverResult;
use crate::platform::ScopedToken;
use crate::reservation::TestRunHandle;
use crate::session::ApplianceSession;

/// Statistics exported for a test run.
#[derive(Debug, Clone, Serialize)]
pub struct ResultArtifact {
    pub file_name: String,
    #[serde(skip)]
    pub statistics: Bytes,
    pub size_bytes: usize,
    /// False when the test had not finished before the polling deadline.
    pub complete: bool,
    pub collected_at: DateTime<Utc>,
    /// Attachment reference returned by the management API, if uploaded.
    pub attachment: Option<String>,
}

pub struct ResultsCollector {
    config: ResultsConfig,
    uploader: Option<Arc<ScopedToken>>,
}

impl ResultsCollector {
    pub fn new(config: ResultsConfig, uploader: Option<Arc<ScopedToken>>) -> Self {
        Self { config, uploader }
    }

    pub async fn collect(
        &self,
        session: &mut dyn ApplianceSession,
        reservation_id: &str,
        handle: &TestRunHandle,
    ) -> DriverResult<ResultArtifact> {
        let complete = self.wait_for_completion(session, handle).await?;
        if !complete {
            warn!(
                reservation_id,
                group = %handle.group,
                max_wait_sec = self.config.max_wait_sec,
                "test still running at polling deadline, exporting partial statistics"
            );
        }

        let output = appliance::execute(
            session,
            &Command::ExportStatistics {
                group: &handle.group,
            },
        )
        .await?;
        let statistics = Bytes::from(output);
        let collected_at = Utc::now();
        let file_name = format!(
            "{}_statistics_{}{}.csv",
            handle.group,
            collected_at.format("%Y%m%d%H%M%S"),
            if complete { "" } else { "_partial" }
        );

        let attachment = match &self.uploader {
            Some(uploader) => {
                let token = uploader.get().await?;
                let reference = uploader
                    .api()
                    .attach_file(&token, reservation_id, &file_name, statistics.clone())
                    .await?;
                Some(reference)
            }
            None => None,
        };

        info!(
            reservation_id,
            file = %file_name,
            bytes = statistics.len(),
            complete,
            uploaded = attachment.is_some(),
            "statistics collected"
        );
        Ok(ResultArtifact {
            size_bytes: statistics.len(),
            file_name,
            statistics,
            complete,
            collected_at,
            attachment,
        })
    }

    /// Poll the group state until it finishes; `Ok(false)` on deadline.
    async fn wait_for_completion(
        &self,
        session: &mut dyn ApplianceSession,
        handle: &TestRunHandle,
    ) -> DriverResult<bool> {
        let deadline = Instant::now() + self.config.max_wait();
        loop {
            let output = appliance::execute(
                session,
                &Command::TestGroupState {
                    group: &handle.group,
                },
            )
            .await?;
            let state = GroupState::parse(&output);
            debug!(group = %handle.group, ?state, "polled test group state");
            if state == GroupState::Finished {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }
}
