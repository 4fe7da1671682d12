//! Authenticated command sessions to the appliance and the bounded pool that
//! hands them out.

pub mod pool;
pub mod ssh;

pub use pool::{PoolStats, PooledSession, SessionPool};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::DriverResult;

/// An authenticated, stateful handle to the appliance's command interface.
///
/// Owned by exactly one holder at a time; the pool never shares one between
/// concurrent callers.
#[async_trait]
pub trait ApplianceSession: Send {
    /// Run one CLI command and return its output.
    async fn send_command(&mut self, command: &str) -> DriverResult<String>;

    /// Write `payload` to `remote_path` on the appliance.
    async fn upload_file(&mut self, remote_path: &str, payload: Bytes) -> DriverResult<()>;

    /// False once the underlying connection is known to be broken.
    fn is_alive(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

/// Opens new authenticated sessions for the pool.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Fails with `DriverError::Connection` when the appliance is unreachable
    /// or rejects the credentials.
    async fn connect(&self) -> DriverResult<Box<dyn ApplianceSession>>;
}
