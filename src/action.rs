//! Actions: one command plus the validation of its response.
//!
//! An action owns its arguments, appends its command envelope to an outgoing
//! packet and checks the value the server sent back for it. Actions never touch
//! the connection.

use std::fmt;

use bytes::BytesMut;

use crate::error::{EncodeError, Error, ProtocolError, Result, ServerError};
use crate::skyhash::encode::append_command;
use crate::skyhash::types::{ResponseCode, Value};

/// Trait for commands that can be pipelined in a [`QueryPacket`](crate::QueryPacket).
pub trait Action: fmt::Debug + Send + Sync {
    /// Append this command's envelope to `buf`.
    fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), EncodeError>;

    /// Check the decoded response for this command.
    ///
    /// Server codes the caller should act on are turned into
    /// [`ServerError`]s; values of the wrong shape into
    /// [`ProtocolError::UnexpectedResponse`].
    fn validate(&self, value: &Value) -> Result<()>;
}

/// Turn a response the action does not accept into an error.
fn reject(action: &'static str, value: &Value) -> Error {
    match value {
        Value::ResponseCode(code) if !code.is_okay() => ServerError::Code(*code).into(),
        Value::ErrorString(text) => ServerError::ErrorString(text.clone()).into(),
        other => ProtocolError::UnexpectedResponse {
            action,
            value: other.to_string(),
        }
        .into(),
    }
}

fn expect_okay(action: &'static str, value: &Value) -> Result<()> {
    match value {
        Value::ResponseCode(ResponseCode::Okay) => Ok(()),
        other => Err(reject(action, other)),
    }
}

fn expect_count(action: &'static str, value: &Value) -> Result<()> {
    match value {
        Value::UnsignedInt64(_) => Ok(()),
        other => Err(reject(action, other)),
    }
}

fn command_with_keys(buf: &mut BytesMut, verb: &str, keys: &[String]) -> std::result::Result<(), EncodeError> {
    let mut segments = Vec::with_capacity(keys.len() + 1);
    segments.push(Value::from(verb));
    segments.extend(keys.iter().map(Value::from));
    append_command(buf, &segments)
}

// ============================================================================
// Connection-level Actions
// ============================================================================

/// `HEYA [echo]`: liveness check.
#[derive(Debug, Clone, Default)]
pub struct Heya {
    pub echo: Option<String>,
}

impl Heya {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn echo(echo: impl Into<String>) -> Self {
        Self {
            echo: Some(echo.into()),
        }
    }
}

impl Action for Heya {
    fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), EncodeError> {
        match &self.echo {
            Some(echo) => append_command(buf, &["HEYA".into(), echo.into()]),
            None => append_command(buf, &["HEYA".into()]),
        }
    }

    fn validate(&self, value: &Value) -> Result<()> {
        let expected = self.echo.as_deref().unwrap_or("HEY!");
        match value {
            Value::String(echo) if echo == expected => Ok(()),
            Value::String(echo) => Err(ProtocolError::UnexpectedResponse {
                action: "HEYA",
                value: format!("{:?}", echo),
            }
            .into()),
            other => Err(reject("HEYA", other)),
        }
    }
}

/// `AUTH LOGIN <username> <token>`.
#[derive(Clone)]
pub struct Login {
    pub username: String,
    pub token: String,
}

impl Login {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }
}

// The token stays out of logs.
impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Action for Login {
    fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), EncodeError> {
        append_command(
            buf,
            &[
                "AUTH".into(),
                "LOGIN".into(),
                (&self.username).into(),
                (&self.token).into(),
            ],
        )
    }

    fn validate(&self, value: &Value) -> Result<()> {
        expect_okay("AUTH LOGIN", value)
    }
}

/// `USE <keyspace[:table]>`: select the default namespace.
#[derive(Debug, Clone)]
pub struct Use {
    pub path: String,
}

impl Use {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Action for Use {
    fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), EncodeError> {
        append_command(buf, &["USE".into(), (&self.path).into()])
    }

    fn validate(&self, value: &Value) -> Result<()> {
        expect_okay("USE", value)
    }
}

/// Properties readable through `SYS INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysInfoProperty {
    Protocol,
    Version,
}

impl SysInfoProperty {
    fn as_str(self) -> &'static str {
        match self {
            SysInfoProperty::Protocol => "PROTOCOL",
            SysInfoProperty::Version => "VERSION",
        }
    }
}

/// `SYS INFO <property>`.
#[derive(Debug, Clone, Copy)]
pub struct SysInfo {
    pub property: SysInfoProperty,
}

impl SysInfo {
    pub fn protocol() -> Self {
        Self {
            property: SysInfoProperty::Protocol,
        }
    }

    pub fn version() -> Self {
        Self {
            property: SysInfoProperty::Version,
        }
    }
}

impl Action for SysInfo {
    fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), EncodeError> {
        append_command(
            buf,
            &["SYS".into(), "INFO".into(), self.property.as_str().into()],
        )
    }

    fn validate(&self, value: &Value) -> Result<()> {
        match value {
            Value::String(_) => Ok(()),
            other => Err(reject("SYS INFO", other)),
        }
    }
}

// ============================================================================
// Key/Value Actions
// ============================================================================

/// `GET <key>`. A missing key is reported as a not-found server error.
#[derive(Debug, Clone)]
pub struct Get {
    pub key: String,
}

impl Get {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Action for Get {
    fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), EncodeError> {
        append_command(buf, &["GET".into(), (&self.key).into()])
    }

    fn validate(&self, value: &Value) -> Result<()> {
        match value {
            Value::String(_) | Value::BinaryString(_) => Ok(()),
            other => Err(reject("GET", other)),
        }
    }
}

/// `SET <key> <value>`. Fails with an overwrite error if the key exists.
#[derive(Debug, Clone)]
pub struct Set {
    pub key: String,
    pub value: Value,
}

impl Set {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Action for Set {
    fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), EncodeError> {
        append_command(buf, &["SET".into(), (&self.key).into(), self.value.clone()])
    }

    fn validate(&self, value: &Value) -> Result<()> {
        expect_okay("SET", value)
    }
}

/// `DEL <key>...`. Responds with the number of deleted keys.
#[derive(Debug, Clone)]
pub struct Del {
    pub keys: Vec<String>,
}

impl Del {
    pub fn new<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl Action for Del {
    fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), EncodeError> {
        command_with_keys(buf, "DEL", &self.keys)
    }

    fn validate(&self, value: &Value) -> Result<()> {
        expect_count("DEL", value)
    }
}

/// `EXISTS <key>...`. Responds with the number of existing keys.
#[derive(Debug, Clone)]
pub struct Exists {
    pub keys: Vec<String>,
}

impl Exists {
    pub fn new<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl Action for Exists {
    fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), EncodeError> {
        command_with_keys(buf, "EXISTS", &self.keys)
    }

    fn validate(&self, value: &Value) -> Result<()> {
        expect_count("EXISTS", value)
    }
}

/// A raw command: a verb and its arguments, sent as-is.
///
/// Any response is accepted; the caller interprets the value.
#[derive(Debug, Clone)]
pub struct Command {
    pub segments: Vec<Value>,
}

impl Command {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            segments: vec![Value::String(verb.into())],
        }
    }

    /// Add one argument.
    pub fn arg(mut self, arg: impl Into<Value>) -> Self {
        self.segments.push(arg.into());
        self
    }

    /// Split a whitespace-separated command line into segments.
    pub fn parse(line: &str) -> Self {
        Self {
            segments: line.split_whitespace().map(Value::from).collect(),
        }
    }
}

impl Action for Command {
    fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), EncodeError> {
        append_command(buf, &self.segments)
    }

    fn validate(&self, _value: &Value) -> Result<()> {
        Ok(())
    }
}
