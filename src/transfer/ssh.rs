//! SFTP and SCP retrieval over an `ssh2` session.
//!
//! The connect/authenticate helper here is shared with the appliance CLI
//! sessions in [`crate::session::ssh`].

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ssh2::{ErrorCode, Session};
use tracing::debug;

use super::{run_blocking, TransferHandler, TransferRequest};
use crate::config::TransferConfig;
use crate::error::{DriverError, DriverResult, FetchErrorKind};

// libssh2 error codes.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SCP_PROTOCOL: i32 = -28;
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const LIBSSH2_FX_PERMISSION_DENIED: i32 = 3;
const LIBSSH2_FX_NO_SUCH_PATH: i32 = 10;

// ---------------------------------------------------------------------------
// Shared connect helper
// ---------------------------------------------------------------------------

/// Why an SSH session could not be established.
#[derive(Debug)]
pub(crate) enum SshConnectError {
    Unreachable(String),
    Timeout(String),
    AuthFailed(String),
    Handshake(String),
}

impl SshConnectError {
    pub(crate) fn into_fetch_error(self, uri: &str) -> DriverError {
        let (kind, message) = match self {
            SshConnectError::Unreachable(m) => (FetchErrorKind::Unreachable, m),
            SshConnectError::Timeout(m) => (FetchErrorKind::Timeout, m),
            SshConnectError::AuthFailed(m) => (FetchErrorKind::AuthFailed, m),
            SshConnectError::Handshake(m) => (FetchErrorKind::ServerError, m),
        };
        DriverError::fetch(kind, uri, message)
    }

    pub(crate) fn message(&self) -> &str {
        match self {
            SshConnectError::Unreachable(m)
            | SshConnectError::Timeout(m)
            | SshConnectError::AuthFailed(m)
            | SshConnectError::Handshake(m) => m,
        }
    }
}

/// Open a TCP connection, run the SSH handshake and authenticate by password.
pub(crate) fn connect_authenticated(
    host: &str,
    port: u16,
    user: &str,
    password: &str,
    timeout: Duration,
) -> Result<Session, SshConnectError> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| SshConnectError::Unreachable(format!("{host}: {e}")))?
        .next()
        .ok_or_else(|| SshConnectError::Unreachable(format!("no address for {host}")))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
        std::io::ErrorKind::TimedOut => SshConnectError::Timeout(format!("{addr}: {e}")),
        _ => SshConnectError::Unreachable(format!("{addr}: {e}")),
    })?;

    let mut session = Session::new().map_err(|e| SshConnectError::Handshake(e.to_string()))?;
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| {
        if matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)) {
            SshConnectError::Timeout(e.to_string())
        } else {
            SshConnectError::Handshake(e.to_string())
        }
    })?;

    session
        .userauth_password(user, password)
        .map_err(|e| SshConnectError::AuthFailed(format!("user '{user}': {e}")))?;
    if !session.authenticated() {
        return Err(SshConnectError::AuthFailed(format!("user '{user}' was not accepted")));
    }
    Ok(session)
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshProtocol {
    Sftp,
    Scp,
}

pub struct SshHandler {
    protocol: SshProtocol,
    connect_timeout: Duration,
    read_timeout: Duration,
    transfer_timeout: Duration,
}

impl SshHandler {
    pub fn new(protocol: SshProtocol, config: &TransferConfig) -> Self {
        Self {
            protocol,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            transfer_timeout: config.transfer_timeout(),
        }
    }
}

#[async_trait]
impl TransferHandler for SshHandler {
    async fn fetch(&self, request: &TransferRequest) -> DriverResult<Bytes> {
        let uri = request.redacted();
        let request = request.clone();
        let protocol = self.protocol;
        let (connect_timeout, read_timeout) = (self.connect_timeout, self.read_timeout);
        run_blocking(&uri, self.transfer_timeout, move || {
            retrieve(&request, protocol, connect_timeout, read_timeout)
        })
        .await
    }
}

fn retrieve(
    request: &TransferRequest,
    protocol: SshProtocol,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> DriverResult<Bytes> {
    let uri = request.redacted();
    let creds = request.credentials().ok_or_else(|| {
        DriverError::fetch(FetchErrorKind::AuthFailed, &uri, "no credentials in location")
    })?;

    let session = connect_authenticated(
        request.host(),
        request.port(),
        &creds.user,
        &creds.password,
        connect_timeout,
    )
    .map_err(|e| e.into_fetch_error(&uri))?;
    session.set_timeout(read_timeout.as_millis().min(u32::MAX as u128) as u32);

    let path = request.path();
    debug!(uri = %uri, ?protocol, "streaming remote file");
    let mut payload = Vec::new();
    match protocol {
        SshProtocol::Sftp => {
            let sftp = session.sftp().map_err(|e| map_ssh_error(&uri, e))?;
            let mut file = sftp.open(Path::new(&path)).map_err(|e| map_ssh_error(&uri, e))?;
            file.read_to_end(&mut payload).map_err(|e| map_io_error(&uri, e))?;
        }
        SshProtocol::Scp => {
            let (mut channel, stat) = session
                .scp_recv(Path::new(&path))
                .map_err(|e| map_ssh_error(&uri, e))?;
            payload.reserve(stat.size() as usize);
            channel.read_to_end(&mut payload).map_err(|e| map_io_error(&uri, e))?;
            let _ = channel.send_eof();
            let _ = channel.wait_eof();
            let _ = channel.close();
            let _ = channel.wait_close();
        }
    }

    let _ = session.disconnect(None, "transfer complete", None);
    Ok(Bytes::from(payload))
}

fn map_ssh_error(uri: &str, e: ssh2::Error) -> DriverError {
    let kind = match e.code() {
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) | ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_PATH) => {
            FetchErrorKind::NotFound
        }
        ErrorCode::SFTP(LIBSSH2_FX_PERMISSION_DENIED) => FetchErrorKind::AuthFailed,
        ErrorCode::Session(LIBSSH2_ERROR_SCP_PROTOCOL) => FetchErrorKind::NotFound,
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => FetchErrorKind::Timeout,
        _ => FetchErrorKind::ServerError,
    };
    DriverError::fetch(kind, uri, e.to_string())
}

fn map_io_error(uri: &str, e: std::io::Error) -> DriverError {
    let kind = match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => FetchErrorKind::Timeout,
        _ => FetchErrorKind::Unreachable,
    };
    DriverError::fetch(kind, uri, e.to_string())
}
