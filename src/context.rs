//! External command context and the resource configuration resolved from it.
//!
//! The orchestration platform hands every command a context carrying the
//! controller resource's attributes and the reservation id. Attribute names
//! may be namespaced by the shell name (`"<shell>.User"`) or bare (`"User"`).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{DriverError, DriverResult};

/// Shell name used to namespace resource attributes.
pub const SHELL_NAME: &str = "TeraVM Controller Shell 2G";

pub const ATTR_USER: &str = "User";
pub const ATTR_PASSWORD: &str = "Password";
pub const ATTR_CLI_PORT: &str = "CLI TCP Port";
pub const ATTR_API_PORT: &str = "API Port";
pub const ATTR_SESSIONS_LIMIT: &str = "Sessions Concurrency Limit";
pub const ATTR_TEST_FILES_LOCATION: &str = "Test Files Location";

const DEFAULT_CLI_PORT: u16 = 22;
const DEFAULT_API_PORT: u16 = 443;
const DEFAULT_SESSIONS_LIMIT: usize = 1;
const DEFAULT_TEST_FILES_LOCATION: &str = "/tmp/trafficctl";

// ---------------------------------------------------------------------------
// CommandContext
// ---------------------------------------------------------------------------

/// Context passed by the orchestration platform with every command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandContext {
    pub resource: ResourceDetails,
    #[serde(default)]
    pub reservation: Option<ReservationDetails>,
    #[serde(default)]
    pub connectivity: Connectivity,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceDetails {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationDetails {
    pub reservation_id: String,
    #[serde(default)]
    pub domain: Option<String>,
}

/// How to reach the orchestration platform's own APIs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connectivity {
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub admin_auth_token: String,
    #[serde(default = "default_platform_api_port")]
    pub api_port: u16,
}

fn default_platform_api_port() -> u16 {
    9000
}

impl CommandContext {
    /// Reservation id for commands that operate on a reservation.
    pub fn reservation_id(&self) -> DriverResult<&str> {
        self.reservation
            .as_ref()
            .map(|r| r.reservation_id.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DriverError::Config("command context carries no reservation id".into()))
    }

    /// Look up a resource attribute, namespaced first, then bare.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        let namespaced = format!("{SHELL_NAME}.{name}");
        self.resource
            .attributes
            .get(&namespaced)
            .or_else(|| self.resource.attributes.get(name))
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Credential decryption
// ---------------------------------------------------------------------------

/// Platform service that turns a stored (encrypted) password into plaintext.
#[async_trait]
pub trait CredentialDecryptor: Send + Sync {
    async fn decrypt(&self, encrypted: &str) -> DriverResult<Zeroizing<String>>;
}

/// Decryptor for contexts whose attributes already carry plaintext.
pub struct PlaintextCredentials;

#[async_trait]
impl CredentialDecryptor for PlaintextCredentials {
    async fn decrypt(&self, encrypted: &str) -> DriverResult<Zeroizing<String>> {
        Ok(Zeroizing::new(encrypted.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ResourceConfig
// ---------------------------------------------------------------------------

/// Immutable snapshot of the appliance connection parameters.
#[derive(Clone)]
pub struct ResourceConfig {
    pub name: String,
    pub address: String,
    pub user: String,
    pub password: Zeroizing<String>,
    pub cli_port: u16,
    pub api_port: u16,
    pub sessions_limit: usize,
    pub test_files_location: String,
}

impl fmt::Debug for ResourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceConfig")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("cli_port", &self.cli_port)
            .field("api_port", &self.api_port)
            .field("sessions_limit", &self.sessions_limit)
            .field("test_files_location", &self.test_files_location)
            .finish()
    }
}

impl ResourceConfig {
    /// Resolve the config from a context, decrypting the password.
    pub async fn resolve(
        ctx: &CommandContext,
        decryptor: &dyn CredentialDecryptor,
    ) -> DriverResult<Arc<Self>> {
        if ctx.resource.address.is_empty() {
            return Err(DriverError::Config("resource address is empty".into()));
        }

        let encrypted = ctx.attribute(ATTR_PASSWORD).unwrap_or_default();
        let password = if encrypted.is_empty() {
            Zeroizing::new(String::new())
        } else {
            decryptor.decrypt(encrypted).await?
        };

        Ok(Arc::new(Self {
            name: ctx.resource.name.clone(),
            address: ctx.resource.address.clone(),
            user: ctx.attribute(ATTR_USER).unwrap_or_default().to_string(),
            password,
            cli_port: parse_attr(ctx, ATTR_CLI_PORT, DEFAULT_CLI_PORT)?,
            api_port: parse_attr(ctx, ATTR_API_PORT, DEFAULT_API_PORT)?,
            sessions_limit: parse_sessions_limit(ctx)?,
            test_files_location: ctx
                .attribute(ATTR_TEST_FILES_LOCATION)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_TEST_FILES_LOCATION)
                .trim_end_matches('/')
                .to_string(),
        }))
    }
}

/// Session concurrency limit, the only attribute `initialize` needs.
pub fn parse_sessions_limit(ctx: &CommandContext) -> DriverResult<usize> {
    let limit = parse_attr(ctx, ATTR_SESSIONS_LIMIT, DEFAULT_SESSIONS_LIMIT)?;
    if limit == 0 {
        return Err(DriverError::Config(format!(
            "{ATTR_SESSIONS_LIMIT} must be at least 1"
        )));
    }
    Ok(limit)
}

fn parse_attr<T: std::str::FromStr>(ctx: &CommandContext, name: &str, default: T) -> DriverResult<T> {
    match ctx.attribute(name).map(str::trim) {
        None | Some("") => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| DriverError::Config(format!("attribute '{name}' has invalid value '{raw}'"))),
    }
}
