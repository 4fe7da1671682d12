//! FTP retrieval over a passive-mode data connection.
//!
//! `suppaftp`'s synchronous client runs on the blocking pool; its replies are
//! mapped onto [`FetchErrorKind`] by FTP status code.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpResult, FtpStream, Mode, Status};
use tracing::debug;

use super::{run_blocking, TransferHandler, TransferRequest};
use crate::config::TransferConfig;
use crate::error::{DriverError, DriverResult, FetchErrorKind};

const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASSWORD: &str = "anonymous@";

pub struct FtpHandler {
    connect_timeout: Duration,
    read_timeout: Duration,
    transfer_timeout: Duration,
}

impl FtpHandler {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            transfer_timeout: config.transfer_timeout(),
        }
    }
}

#[async_trait]
impl TransferHandler for FtpHandler {
    async fn fetch(&self, request: &TransferRequest) -> DriverResult<Bytes> {
        let uri = request.redacted();
        let request = request.clone();
        let (connect_timeout, read_timeout) = (self.connect_timeout, self.read_timeout);
        run_blocking(&uri, self.transfer_timeout, move || {
            retrieve(&request, connect_timeout, read_timeout)
        })
        .await
    }
}

fn retrieve(request: &TransferRequest, connect_timeout: Duration, read_timeout: Duration) -> DriverResult<Bytes> {
    let uri = request.redacted();
    let addr = resolve(&uri, request.host(), request.port())?;

    let mut ftp = FtpStream::connect_timeout(addr, connect_timeout)
        .map_err(|e| map_error(&uri, e))?
        .passive_stream_builder(move |data_addr| data_stream(data_addr, connect_timeout, read_timeout));
    ftp.get_ref()
        .set_read_timeout(Some(read_timeout))
        .map_err(|e| DriverError::fetch(FetchErrorKind::Unreachable, &uri, e.to_string()))?;

    let (user, password) = match request.credentials() {
        Some(creds) => (creds.user, creds.password),
        None => (ANONYMOUS_USER.to_string(), ANONYMOUS_PASSWORD.to_string().into()),
    };
    debug!(uri = %uri, user = %user, "ftp login");
    ftp.login(user.as_str(), password.as_str()).map_err(|e| match e {
        // Any protocol-level rejection during login is an authentication failure.
        FtpError::UnexpectedResponse(resp) => DriverError::fetch(
            FetchErrorKind::AuthFailed,
            &uri,
            String::from_utf8_lossy(&resp.body).trim().to_string(),
        ),
        other => map_error(&uri, other),
    })?;

    ftp.transfer_type(FileType::Binary).map_err(|e| map_error(&uri, e))?;
    ftp.set_mode(Mode::Passive);

    // FTP paths are relative to the login directory.
    let path = request.path();
    let remote = path.trim_start_matches('/');
    let buffer = ftp.retr_as_buffer(remote).map_err(|e| map_error(&uri, e))?;
    let _ = ftp.quit();

    Ok(Bytes::from(buffer.into_inner()))
}

/// Passive data connection with the same timeouts as the control socket.
fn data_stream(addr: SocketAddr, connect_timeout: Duration, read_timeout: Duration) -> FtpResult<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(FtpError::ConnectionError)?;
    stream
        .set_read_timeout(Some(read_timeout))
        .map_err(FtpError::ConnectionError)?;
    Ok(stream)
}

fn resolve(uri: &str, host: &str, port: u16) -> DriverResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| DriverError::fetch(FetchErrorKind::Unreachable, uri, e.to_string()))?
        .next()
        .ok_or_else(|| DriverError::fetch(FetchErrorKind::Unreachable, uri, format!("no address for {host}")))
}

fn map_error(uri: &str, e: FtpError) -> DriverError {
    let kind = match &e {
        FtpError::ConnectionError(io) => match io.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => FetchErrorKind::Timeout,
            _ => FetchErrorKind::Unreachable,
        },
        FtpError::UnexpectedResponse(resp) => match resp.status {
            Status::NotLoggedIn => FetchErrorKind::AuthFailed,
            Status::FileUnavailable => FetchErrorKind::NotFound,
            _ => FetchErrorKind::ServerError,
        },
        _ => FetchErrorKind::ServerError,
    };
    DriverError::fetch(kind, uri, e.to_string())
}
