//! REST client for the orchestration platform's APIs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{multipart, Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{ApiToken, ManagementApi, Platform, ReservationResources, ReservedPort};
use crate::config::DriverConfig;
use crate::context::{CommandContext, CredentialDecryptor, ResourceConfig};
use crate::error::{DriverError, DriverResult};
use crate::session::ssh::SshCliConnector;
use crate::session::SessionConnector;

const DEFAULT_DOMAIN: &str = "Global";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Production [`Platform`]: talks to the platform server named in the context.
pub struct HttpPlatform {
    token_ttl: chrono::Duration,
}

impl HttpPlatform {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            token_ttl: chrono::Duration::seconds(config.results.token_ttl_sec as i64),
        }
    }

    fn client(&self, ctx: &CommandContext) -> DriverResult<Arc<PlatformClient>> {
        PlatformClient::from_context(ctx, self.token_ttl).map(Arc::new)
    }
}

impl Platform for HttpPlatform {
    fn decryptor(&self, ctx: &CommandContext) -> DriverResult<Arc<dyn CredentialDecryptor>> {
        Ok(self.client(ctx)?)
    }

    fn resources(&self, ctx: &CommandContext) -> DriverResult<Arc<dyn ReservationResources>> {
        Ok(self.client(ctx)?)
    }

    fn management(&self, ctx: &CommandContext) -> DriverResult<Arc<dyn ManagementApi>> {
        Ok(self.client(ctx)?)
    }

    fn connector(&self, resource: Arc<ResourceConfig>, config: &DriverConfig) -> Arc<dyn SessionConnector> {
        Arc::new(SshCliConnector::new(resource, &config.pool))
    }
}

// ---------------------------------------------------------------------------
// PlatformClient
// ---------------------------------------------------------------------------

pub struct PlatformClient {
    client: Client,
    base_url: String,
    admin_token: Zeroizing<String>,
    domain: String,
    token_ttl: chrono::Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseRequest<'a> {
    reservation_id: &'a str,
    resource_names: Vec<&'a str>,
}

#[derive(Deserialize)]
struct DecryptResponse {
    value: String,
}

impl PlatformClient {
    pub fn from_context(ctx: &CommandContext, token_ttl: chrono::Duration) -> DriverResult<Self> {
        let server = ctx.connectivity.server_address.trim();
        if server.is_empty() {
            return Err(DriverError::Config("context has no platform server address".into()));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DriverError::Config(format!("failed to build HTTP client: {e}")))?;
        let domain = ctx
            .reservation
            .as_ref()
            .and_then(|r| r.domain.clone())
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());
        Ok(Self {
            client,
            base_url: format!("http://{}:{}/API", server, ctx.connectivity.api_port),
            admin_token: Zeroizing::new(ctx.connectivity.admin_auth_token.clone()),
            domain,
            token_ttl,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("Authorization", format!("Basic {}", self.admin_token.as_str()))
    }

    async fn send(&self, what: &str, builder: RequestBuilder) -> DriverResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| DriverError::ManagementApi(format!("{what}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::ManagementApi(format!(
                "{what}: HTTP {status}: {}",
                body.trim()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl CredentialDecryptor for PlatformClient {
    async fn decrypt(&self, encrypted: &str) -> DriverResult<Zeroizing<String>> {
        let url = format!("{}/Credentials/Decrypt", self.base_url);
        let response = self
            .send(
                "decrypt password",
                self.authorized(self.client.post(url)).json(&json!({ "value": encrypted })),
            )
            .await?;
        let body: DecryptResponse = response
            .json()
            .await
            .map_err(|e| DriverError::ManagementApi(format!("decrypt password: {e}")))?;
        Ok(Zeroizing::new(body.value))
    }
}

#[async_trait]
impl ReservationResources for PlatformClient {
    async fn reserved_ports(&self, reservation_id: &str) -> DriverResult<Vec<ReservedPort>> {
        let url = format!("{}/Reservations/{}/Resources", self.base_url, reservation_id);
        let response = self
            .send(
                "list reserved ports",
                self.authorized(self.client.get(url)).query(&[("family", "Port")]),
            )
            .await?;
        let ports: Vec<ReservedPort> = response
            .json()
            .await
            .map_err(|e| DriverError::ManagementApi(format!("list reserved ports: {e}")))?;
        debug!(reservation_id, count = ports.len(), "reserved ports listed");
        Ok(ports)
    }

    async fn release_ports(&self, reservation_id: &str, ports: &[ReservedPort]) -> DriverResult<()> {
        let url = format!("{}/Reservations/{}/Resources/Release", self.base_url, reservation_id);
        let body = ReleaseRequest {
            reservation_id,
            resource_names: ports.iter().map(|p| p.name.as_str()).collect(),
        };
        self.send("release ports", self.authorized(self.client.post(url)).json(&body))
            .await?;
        info!(reservation_id, count = ports.len(), "reserved ports released");
        Ok(())
    }
}

#[async_trait]
impl ManagementApi for PlatformClient {
    async fn login(&self) -> DriverResult<ApiToken> {
        let url = format!("{}/Auth/Login", self.base_url);
        let response = self
            .send(
                "management login",
                self.client.put(url).json(&json!({
                    "token": self.admin_token.as_str(),
                    "domain": self.domain,
                })),
            )
            .await?;
        let raw = response
            .text()
            .await
            .map_err(|e| DriverError::ManagementApi(format!("management login: {e}")))?;
        Ok(ApiToken {
            value: raw.trim().trim_matches('"').to_string(),
            expires_at: Utc::now() + self.token_ttl,
        })
    }

    async fn attach_file(
        &self,
        token: &ApiToken,
        reservation_id: &str,
        file_name: &str,
        payload: Bytes,
    ) -> DriverResult<String> {
        let url = format!("{}/Package/AttachFileToReservation", self.base_url);
        let part = multipart::Part::bytes(payload.to_vec()).file_name(file_name.to_string());
        let form = multipart::Form::new()
            .text("reservationId", reservation_id.to_string())
            .text("saveFileAs", file_name.to_string())
            .text("overwriteIfExists", "true")
            .part("QualiPackage", part);
        self.send(
            "attach file",
            self.client
                .post(url)
                .header("Authorization", format!("Basic {}", token.value))
                .multipart(form),
        )
        .await?;
        info!(reservation_id, file_name, "artifact attached to reservation");
        Ok(format!("reservation://{reservation_id}/attachments/{file_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Connectivity, ReservationDetails};

    #[test]
    fn requires_server_address() {
        let ctx = CommandContext::default();
        assert!(PlatformClient::from_context(&ctx, chrono::Duration::seconds(60)).is_err());
    }

    #[test]
    fn base_url_and_domain_come_from_context() {
        let ctx = CommandContext {
            connectivity: Connectivity {
                server_address: "192.168.85.40".into(),
                admin_auth_token: "admin".into(),
                api_port: 9000,
            },
            reservation: Some(ReservationDetails {
                reservation_id: "r1".into(),
                domain: Some("Lab".into()),
            }),
            ..Default::default()
        };
        let client = PlatformClient::from_context(&ctx, chrono::Duration::seconds(60)).unwrap();
        assert_eq!(client.base_url, "http://192.168.85.40:9000/API");
        assert_eq!(client.domain, "Lab");
    }
}
