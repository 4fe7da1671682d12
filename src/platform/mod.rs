//! Collaborators owned by the orchestration platform: reservation resource
//! bookkeeping, the management API used for artifact upload, and credential
//! decryption. Only their interfaces matter to the driver.

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DriverConfig;
use crate::context::{CommandContext, CredentialDecryptor, ResourceConfig};
use crate::error::DriverResult;
use crate::session::SessionConnector;

// ---------------------------------------------------------------------------
// Reservation resources
// ---------------------------------------------------------------------------

/// A traffic port the platform has allocated to a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedPort {
    /// Platform resource name, e.g. `"TeraVM Chassis/Module1/Port 3"`.
    pub name: String,
    /// Appliance-side interface address, e.g. `"1/1/3"`.
    pub address: String,
}

#[async_trait]
pub trait ReservationResources: Send + Sync {
    async fn reserved_ports(&self, reservation_id: &str) -> DriverResult<Vec<ReservedPort>>;

    async fn release_ports(&self, reservation_id: &str, ports: &[ReservedPort]) -> DriverResult<()>;
}

// ---------------------------------------------------------------------------
// Management API
// ---------------------------------------------------------------------------

/// Session token for the management API, valid until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl ApiToken {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[async_trait]
pub trait ManagementApi: Send + Sync {
    async fn login(&self) -> DriverResult<ApiToken>;

    /// Attach a file to the reservation; returns a reference to the attachment.
    async fn attach_file(
        &self,
        token: &ApiToken,
        reservation_id: &str,
        file_name: &str,
        payload: Bytes,
    ) -> DriverResult<String>;
}

/// Holds the current management token and logs in again once it expires.
pub struct ScopedToken {
    api: Arc<dyn ManagementApi>,
    current: Mutex<Option<ApiToken>>,
}

impl ScopedToken {
    pub fn new(api: Arc<dyn ManagementApi>) -> Self {
        Self {
            api,
            current: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> DriverResult<ApiToken> {
        let mut current = self.current.lock().await;
        match current.as_ref() {
            Some(token) if !token.is_expired() => Ok(token.clone()),
            _ => {
                debug!("logging in to management API");
                let token = self.api.login().await?;
                *current = Some(token.clone());
                Ok(token)
            }
        }
    }

    pub fn api(&self) -> &Arc<dyn ManagementApi> {
        &self.api
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Builds the per-command collaborators from the command context.
pub trait Platform: Send + Sync {
    fn decryptor(&self, ctx: &CommandContext) -> DriverResult<Arc<dyn CredentialDecryptor>>;

    fn resources(&self, ctx: &CommandContext) -> DriverResult<Arc<dyn ReservationResources>>;

    fn management(&self, ctx: &CommandContext) -> DriverResult<Arc<dyn ManagementApi>>;

    fn connector(&self, resource: Arc<ResourceConfig>, config: &DriverConfig) -> Arc<dyn SessionConnector>;
}
