//! Skyhash connection implementation.
//!
//! A [`Connection`] owns one TCP stream, a reusable write buffer and a
//! [`ResponseReader`]. Its core operation is [`Connection::send_and_receive`]:
//! encode a batch of actions, write it, read the batch of responses and let
//! every action validate its own entry.
//!
//! Any transport failure or unrecoverable decode error closes the connection.
//! A closed connection either refuses further use or, with auto-reconnect
//! enabled, redials and repeats the handshake on the next call.

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::action::{Action, Command, Del, Exists, Get, Heya, Login, Set, SysInfo, Use};
use crate::config::{AuthProvider, ConnectionConfig};
use crate::error::{Error, ProtocolError, Result, UsageError};
use crate::query::{QueryPacket, ResponsePacket};
use crate::skyhash::encode::append_batch_header;
use crate::skyhash::types::Value;
use crate::skyhash::{ResponseReader, PROTOCOL_VERSION};

const WRITE_BUFFER_CAPACITY: usize = 4096;

/// The two halves of an open TCP stream.
struct Transport {
    reader: OwnedReadHalf,
    writer: BufWriter<OwnedWriteHalf>,
}

/// A single connection to a Skyhash server.
///
/// Not meant for concurrent use; share connections through a
/// [`ConnectionPool`](crate::ConnectionPool).
pub struct Connection {
    /// `None` once the connection is closed
    transport: Option<Transport>,
    /// Outgoing packet buffer, cleared before every encode
    write_buf: BytesMut,
    reader: ResponseReader,
    config: ConnectionConfig,
    /// The failure that closed the connection
    last_error: Option<Arc<Error>>,
    /// Set by [`Connection::close`]; a shut connection never reconnects
    shut: bool,
    /// An exchange has taken the transport and not finished
    in_flight: bool,
    created_at: Instant,
    last_used: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.config.addr)
            .field("closed", &self.is_closed())
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to the server at `addr` with default settings.
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::open(ConnectionConfig::new(addr)).await
    }

    /// Connect using a `skyhash://` URL.
    pub async fn connect_url(url: &str) -> Result<Self> {
        Self::open(ConnectionConfig::from_url(url)?).await
    }

    /// Dial, check the protocol version, then log in and select the default
    /// namespace if configured.
    pub async fn open(config: ConnectionConfig) -> Result<Self> {
        let transport = dial(&config).await?;
        let now = Instant::now();
        let mut conn = Self {
            transport: Some(transport),
            write_buf: BytesMut::with_capacity(WRITE_BUFFER_CAPACITY),
            reader: ResponseReader::with_max_size(config.max_response_size),
            config,
            last_error: None,
            shut: false,
            in_flight: false,
            created_at: now,
            last_used: now,
        };

        conn.handshake().await?;
        Ok(conn)
    }

    async fn handshake(&mut self) -> Result<()> {
        let result = self.handshake_steps().await;
        if let Err(e) = &result {
            debug!(addr = %self.config.addr, error = %e, "handshake failed");
            self.transport = None;
        }
        result
    }

    async fn handshake_steps(&mut self) -> Result<()> {
        let version = self.round_trip(SysInfo::protocol()).await?;
        if version.as_str() != Some(PROTOCOL_VERSION) {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: match version {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
            });
        }

        if let Some(auth) = self.config.auth.clone() {
            let (username, token) = auth_credentials(&auth)?;
            self.round_trip(Login::new(username, token)).await?;
        }

        if let Some(namespace) = self.config.namespace.clone() {
            self.round_trip(Use::new(namespace)).await?;
        }

        debug!(addr = %self.config.addr, "connection ready");
        Ok(())
    }

    /// Send a single action without the closed/reconnect checks.
    async fn round_trip(&mut self, action: impl Action + 'static) -> Result<Value> {
        self.exchange(&QueryPacket::single(action)).await?.into_first()
    }

    async fn reconnect(&mut self) -> Result<()> {
        debug!(addr = %self.config.addr, "reconnecting");
        self.reader.reset();
        let transport = match dial(&self.config).await {
            Ok(transport) => transport,
            Err(e) => {
                self.last_error = Some(Arc::new(e.clone()));
                return Err(e);
            }
        };
        self.transport = Some(transport);

        if let Err(e) = self.handshake().await {
            self.last_error = Some(Arc::new(e.clone()));
            return Err(e);
        }

        self.last_error = None;
        self.created_at = Instant::now();
        Ok(())
    }

    // ========================================================================
    // Packet exchange
    // ========================================================================

    /// Send every action of `packet` in one batch and read their responses.
    ///
    /// Entries come back in action order. An entry carries an error when it
    /// failed to decode locally or its action rejected it; the packet as a
    /// whole only fails on usage, transport or fatal protocol errors.
    ///
    /// The packet's cancellation token is checked once, before anything is
    /// written. Dropping the returned future mid-exchange closes the
    /// connection.
    pub async fn send_and_receive(&mut self, packet: QueryPacket) -> Result<ResponsePacket> {
        if packet.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if packet.is_empty() {
            return Err(UsageError::EmptyPacket.into());
        }
        self.note_abandoned_exchange();
        if self.is_closed() {
            if self.shut || !self.config.auto_reconnect {
                return Err(self.closed_error());
            }
            self.reconnect().await?;
        }

        self.exchange(&packet).await
    }

    async fn exchange(&mut self, packet: &QueryPacket) -> Result<ResponsePacket> {
        let actions = packet.actions();

        self.write_buf.clear();
        append_batch_header(&mut self.write_buf, actions.len());
        for action in actions {
            if let Err(e) = action.encode(&mut self.write_buf) {
                self.write_buf.clear();
                return Err(e.into());
            }
        }

        // Taken for the duration of the exchange, put back only on success.
        let Some(mut transport) = self.transport.take() else {
            return Err(self.closed_error());
        };
        self.in_flight = true;

        if let Err(e) = write_packet(&mut transport.writer, &self.write_buf).await {
            return Err(self.fail(Error::communication("failed to write to conn", e)));
        }

        let mut entries = match self.reader.read(&mut transport.reader).await {
            Ok(entries) => entries,
            Err(partial) => {
                debug!(
                    decoded = partial.entries.len(),
                    expected = actions.len(),
                    "response read failed"
                );
                return Err(self.fail(partial.error));
            }
        };

        if entries.len() != actions.len() {
            return Err(self.fail(
                ProtocolError::EntryCountMismatch {
                    expected: actions.len(),
                    actual: entries.len(),
                }
                .into(),
            ));
        }

        self.transport = Some(transport);
        self.in_flight = false;

        for (entry, action) in entries.iter_mut().zip(actions) {
            if entry.error.is_none() {
                entry.error = action.validate(&entry.value).err();
            }
        }

        self.last_used = Instant::now();
        Ok(ResponsePacket::new(entries))
    }

    /// Close after a failure, remembering the cause.
    fn fail(&mut self, err: Error) -> Error {
        warn!(addr = %self.config.addr, error = %err, "closing connection after failure");
        self.transport = None;
        self.in_flight = false;
        self.reader.reset();
        self.last_error = Some(Arc::new(err.clone()));
        err
    }

    fn closed_error(&self) -> Error {
        UsageError::ConnectionClosed {
            cause: self.last_error(),
        }
        .into()
    }

    /// Record why the connection closed if an exchange was dropped before it
    /// finished.
    fn note_abandoned_exchange(&mut self) {
        if self.in_flight {
            self.in_flight = false;
            if self.last_error.is_none() {
                warn!(addr = %self.config.addr, "connection closed by an abandoned exchange");
                self.last_error = Some(Arc::new(abandoned_exchange()));
            }
        }
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Run one action and return its value.
    pub async fn exec(&mut self, action: impl Action + 'static) -> Result<Value> {
        self.send_and_receive(QueryPacket::single(action))
            .await?
            .into_first()
    }

    /// Run a whitespace-separated raw command, e.g. `"MGET a b"`.
    pub async fn exec_command(&mut self, line: &str) -> Result<Value> {
        self.exec(Command::parse(line)).await
    }

    /// Check the server is alive.
    pub async fn heya(&mut self) -> Result<()> {
        self.exec(Heya::new()).await.map(|_| ())
    }

    /// Authenticate with `AUTH LOGIN`.
    pub async fn login(&mut self, username: &str, token: &str) -> Result<()> {
        self.exec(Login::new(username, token)).await.map(|_| ())
    }

    /// Log in with credentials from `provider`.
    pub async fn login_with(&mut self, provider: &AuthProvider) -> Result<()> {
        let (username, token) = auth_credentials(provider)?;
        self.login(&username, &token).await
    }

    /// Select the default namespace. It is selected again after a reconnect.
    pub async fn use_namespace(&mut self, path: &str) -> Result<()> {
        self.exec(Use::new(path)).await?;
        self.config.namespace = Some(path.to_string());
        Ok(())
    }

    pub async fn sys_info_protocol(&mut self) -> Result<String> {
        let value = self.exec(SysInfo::protocol()).await?;
        expect_string("SYS INFO PROTOCOL", value)
    }

    pub async fn sys_info_version(&mut self) -> Result<String> {
        let value = self.exec(SysInfo::version()).await?;
        expect_string("SYS INFO VERSION", value)
    }

    /// Get the value of `key`. A missing key fails with
    /// [`Error::is_not_found`].
    pub async fn get(&mut self, key: &str) -> Result<Value> {
        self.exec(Get::new(key)).await
    }

    /// Set `key` to `value`; fails if the key already exists.
    pub async fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.exec(Set::new(key, value)).await.map(|_| ())
    }

    /// Delete `keys`, returning how many existed.
    pub async fn del(&mut self, keys: &[&str]) -> Result<u64> {
        let value = self.exec(Del::new(keys.iter().copied())).await?;
        expect_count("DEL", value)
    }

    /// Count how many of `keys` exist.
    pub async fn exists(&mut self, keys: &[&str]) -> Result<u64> {
        let value = self.exec(Exists::new(keys.iter().copied())).await?;
        expect_count("EXISTS", value)
    }

    /// Shut down the stream. A closed connection is never reopened.
    pub async fn close(&mut self) {
        self.shut = true;
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.writer.shutdown().await;
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// The failure that closed this connection, if any.
    pub fn last_error(&self) -> Option<Arc<Error>> {
        match &self.last_error {
            Some(err) => Some(Arc::clone(err)),
            None if self.in_flight => Some(Arc::new(abandoned_exchange())),
            None => None,
        }
    }

    /// When the current stream was opened.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the last successful exchange finished.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

async fn dial(config: &ConnectionConfig) -> Result<Transport> {
    debug!(addr = %config.addr, "dialing skyhash server");
    let connect = TcpStream::connect(config.addr.as_str());
    let stream = match config.connect_timeout {
        Some(limit) => match tokio::time::timeout(limit, connect).await {
            Ok(result) => result,
            Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
        },
        None => connect.await,
    }
    .map_err(|e| Error::communication("failed to dial server", e))?;

    stream
        .set_nodelay(true)
        .map_err(|e| Error::communication("failed to configure socket", e))?;

    let (reader, writer) = stream.into_split();
    Ok(Transport {
        reader,
        writer: BufWriter::new(writer),
    })
}

async fn write_packet(writer: &mut BufWriter<OwnedWriteHalf>, packet: &[u8]) -> std::io::Result<()> {
    writer.write_all(packet).await?;
    writer.flush().await
}

fn abandoned_exchange() -> Error {
    Error::communication(
        "exchange dropped before the response was read",
        std::io::ErrorKind::Interrupted.into(),
    )
}

fn auth_credentials(provider: &AuthProvider) -> Result<(String, String)> {
    provider
        .credentials()
        .map_err(|e| UsageError::AuthProvider(e.to_string()).into())
}

fn expect_string(action: &'static str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ProtocolError::UnexpectedResponse {
            action,
            value: other.to_string(),
        }
        .into()),
    }
}

fn expect_count(action: &'static str, value: Value) -> Result<u64> {
    value.as_u64().ok_or_else(|| {
        ProtocolError::UnexpectedResponse {
            action,
            value: value.to_string(),
        }
        .into()
    })
}
