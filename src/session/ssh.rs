//! SSH-backed appliance CLI sessions.
//!
//! Each session is one authenticated `ssh2` connection; commands run on
//! their own exec channel and files are staged with SCP. `ssh2` is blocking,
//! so every call is moved onto the blocking pool and bounded by the command
//! timeout.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::{ApplianceSession, SessionConnector};
use crate::config::PoolConfig;
use crate::context::ResourceConfig;
use crate::error::{DriverError, DriverResult};
use crate::transfer::ssh::{connect_authenticated, SshConnectError};

/// Opens CLI sessions to the appliance described by a [`ResourceConfig`].
pub struct SshCliConnector {
    resource: Arc<ResourceConfig>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshCliConnector {
    pub fn new(resource: Arc<ResourceConfig>, config: &PoolConfig) -> Self {
        Self {
            resource,
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
        }
    }
}

#[async_trait]
impl SessionConnector for SshCliConnector {
    async fn connect(&self) -> DriverResult<Box<dyn ApplianceSession>> {
        let resource = self.resource.clone();
        let timeout = self.connect_timeout;
        let session = tokio::task::spawn_blocking(move || {
            connect_authenticated(
                &resource.address,
                resource.cli_port,
                &resource.user,
                &resource.password,
                timeout,
            )
        })
        .await
        .map_err(|e| DriverError::Connection(format!("connect task aborted: {e}")))?
        .map_err(|e: SshConnectError| {
            DriverError::Connection(format!(
                "{}@{}:{}: {}",
                self.resource.user,
                self.resource.address,
                self.resource.cli_port,
                e.message()
            ))
        })?;

        debug!(address = %self.resource.address, "appliance CLI session authenticated");
        Ok(Box::new(SshCliSession {
            session: Arc::new(session),
            alive: true,
            command_timeout: self.command_timeout,
        }))
    }
}

pub struct SshCliSession {
    session: Arc<ssh2::Session>,
    alive: bool,
    command_timeout: Duration,
}

impl SshCliSession {
    async fn blocking<T, F>(&mut self, what: &str, f: F) -> DriverResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ssh2::Session) -> DriverResult<T> + Send + 'static,
    {
        let session = self.session.clone();
        let task = tokio::task::spawn_blocking(move || f(&session));
        match tokio::time::timeout(self.command_timeout, task).await {
            Ok(Ok(result)) => {
                if matches!(result, Err(DriverError::Connection(_))) {
                    self.alive = false;
                }
                result
            }
            Ok(Err(e)) => {
                self.alive = false;
                Err(DriverError::Connection(format!("{what} task aborted: {e}")))
            }
            Err(_) => {
                // The channel state is unknown after a timeout.
                self.alive = false;
                Err(DriverError::Timeout(format!(
                    "{what} did not finish within {}s",
                    self.command_timeout.as_secs()
                )))
            }
        }
    }
}

#[async_trait]
impl ApplianceSession for SshCliSession {
    async fn send_command(&mut self, command: &str) -> DriverResult<String> {
        let cmd = command.to_string();
        self.blocking("command", move |session| run_command(session, &cmd))
            .await
    }

    async fn upload_file(&mut self, remote_path: &str, payload: Bytes) -> DriverResult<()> {
        let path = remote_path.to_string();
        self.blocking("upload", move |session| {
            let mut channel = session
                .scp_send(Path::new(&path), 0o644, payload.len() as u64, None)
                .map_err(|e| DriverError::ApplianceCommand {
                    command: format!("scp {path}"),
                    output: e.to_string(),
                })?;
            write_scp(&mut channel, &path, &payload)
        })
        .await
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn close(&mut self) {
        self.alive = false;
        let session = self.session.clone();
        let disconnect = tokio::task::spawn_blocking(move || session.disconnect(None, "session closed", None));
        match tokio::time::timeout(self.command_timeout, disconnect).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "appliance session did not disconnect cleanly"),
            Ok(Err(e)) => warn!(error = %e, "disconnect task aborted"),
            Err(_) => warn!("appliance session disconnect timed out"),
        }
    }
}

/// The parts of an SCP channel an upload drives.
trait ScpChannel: Write {
    /// Send EOF and wait until the remote end has closed the channel.
    fn finish(&mut self) -> Result<(), ssh2::Error>;
}

impl ScpChannel for ssh2::Channel {
    fn finish(&mut self) -> Result<(), ssh2::Error> {
        self.send_eof()?;
        self.wait_eof()?;
        self.close()?;
        self.wait_close()
    }
}

/// Write the payload and wait for the remote side to acknowledge the file.
fn write_scp(channel: &mut impl ScpChannel, path: &str, payload: &[u8]) -> DriverResult<()> {
    channel
        .write_all(payload)
        .map_err(|e| DriverError::Connection(format!("scp to {path}: {e}")))?;
    channel
        .finish()
        .map_err(|e| DriverError::Connection(format!("scp to {path} was not confirmed: {e}")))
}

fn run_command(session: &ssh2::Session, command: &str) -> DriverResult<String> {
    let lost = |e: ssh2::Error| DriverError::Connection(format!("channel for '{command}': {e}"));
    let mut channel = session.channel_session().map_err(lost)?;
    channel.exec(command).map_err(lost)?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|e| DriverError::Connection(format!("reading '{command}': {e}")))?;
    let mut stderr = String::new();
    let _ = channel.stderr().read_to_string(&mut stderr);
    let _ = channel.wait_close();

    let status = channel.exit_status().map_err(lost)?;
    if status != 0 {
        let output = if stderr.trim().is_empty() { stdout } else { stderr };
        return Err(DriverError::ApplianceCommand {
            command: command.to_string(),
            output: format!("exit {status}: {}", output.trim()),
        });
    }
    Ok(stdout)
}
