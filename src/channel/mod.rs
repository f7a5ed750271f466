//! Remote command channel
//!
//! One authenticated SSH session, held for the whole run and owned
//! exclusively by the poll loop:
//! - `RemoteChannel` is the seam the loop polls through
//! - `SshChannel` implements it over libssh2; the bindings are blocking, so
//!   every call runs on a blocking task
//! - Errors are split into fatal (session gone) and tick-local (one command
//!   failed) via `ChannelError::is_fatal`

use std::io::Read;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{ErrorCode, Session};
use thiserror::Error;
use tracing::debug;

// libssh2 socket-level error codes; any of these means the session is dead.
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The session could not be established. Fatal: the run never starts.
    #[error("failed to connect: {0}")]
    Connect(String),
    /// The session died underneath us. Fatal: the loop stops.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// One command failed. Tick-local: the loop retries next tick.
    #[error("remote command failed: {0}")]
    Exec(String),
    /// One command exceeded the per-tick deadline. Tick-local.
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),
}

impl ChannelError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::ConnectionLost(_))
    }
}

/// Capability to run one command on the remote host and collect its output.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn execute(&self, command: &str) -> Result<String, ChannelError>;
}

/// How the SSH session authenticates.
#[derive(Debug, Clone)]
pub enum SshAuth {
    KeyFile(PathBuf),
    Password(String),
}

/// A persistent SSH session. libssh2 sessions are not `Sync`, so the session
/// sits behind a mutex and every operation hops onto a blocking task; the
/// loop issues one command at a time anyway.
pub struct SshChannel {
    session: Arc<Mutex<Session>>,
}

impl SshChannel {
    /// Establish the session: TCP connect, handshake, authenticate.
    /// Any failure here is `ChannelError::Connect`.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        auth: SshAuth,
    ) -> Result<Self, ChannelError> {
        let host = host.to_string();
        let user = user.to_string();

        let session = tokio::task::spawn_blocking(move || -> Result<Session, ChannelError> {
            let tcp = TcpStream::connect((host.as_str(), port))
                .map_err(|e| ChannelError::Connect(format!("{host}:{port}: {e}")))?;

            let mut session =
                Session::new().map_err(|e| ChannelError::Connect(e.to_string()))?;
            session.set_tcp_stream(tcp);
            session
                .handshake()
                .map_err(|e| ChannelError::Connect(format!("handshake failed: {e}")))?;

            match auth {
                SshAuth::KeyFile(key) => session
                    .userauth_pubkey_file(&user, None, &key, None)
                    .map_err(|e| {
                        ChannelError::Connect(format!("key authentication failed: {e}"))
                    })?,
                SshAuth::Password(password) => {
                    session.userauth_password(&user, &password).map_err(|e| {
                        ChannelError::Connect(format!("password authentication failed: {e}"))
                    })?
                }
            }

            debug!(host = %host, port, user = %user, "ssh session established");
            Ok(session)
        })
        .await
        .map_err(|e| ChannelError::Connect(e.to_string()))??;

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
        })
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn execute(&self, command: &str) -> Result<String, ChannelError> {
        let session = Arc::clone(&self.session);
        let command = command.to_string();

        tokio::task::spawn_blocking(move || -> Result<String, ChannelError> {
            let session = session.lock().unwrap_or_else(|e| e.into_inner());

            let mut channel = session.channel_session().map_err(classify)?;
            channel.exec(&command).map_err(classify)?;

            let mut output = String::new();
            channel
                .read_to_string(&mut output)
                .map_err(|e| ChannelError::Exec(format!("reading output: {e}")))?;

            // Drain the channel; a failed close is not worth failing the tick.
            let _ = channel.wait_close();
            match channel.exit_status() {
                Ok(0) | Err(_) => Ok(output),
                Ok(code) => Err(ChannelError::Exec(format!(
                    "{command:?} exited with status {code}"
                ))),
            }
        })
        .await
        .map_err(|e| ChannelError::Exec(e.to_string()))?
    }
}

/// Map a libssh2 error to the fatal/tick-local split.
fn classify(err: ssh2::Error) -> ChannelError {
    match err.code() {
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND
            | LIBSSH2_ERROR_SOCKET_DISCONNECT
            | LIBSSH2_ERROR_SOCKET_TIMEOUT
            | LIBSSH2_ERROR_SOCKET_RECV,
        ) => ChannelError::ConnectionLost(err.to_string()),
        _ => ChannelError::Exec(err.to_string()),
    }
}
