//! Error types for the Skyhash client.
//!
//! Errors fall into four families: caller misuse ([`UsageError`]), transport
//! failures (`Communication`), malformed or unexpected responses
//! ([`ProtocolError`]) and errors reported by the server ([`ServerError`]).

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::skyhash::types::{CompoundType, DataType, ResponseCode};

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("communication error: {context}")]
    Communication {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Server(#[from] ServerError),

    #[error("protocol version mismatch: client implements {expected}, server implements {actual}")]
    VersionMismatch {
        expected: &'static str,
        actual: String,
    },

    #[error("packet was cancelled before it was sent")]
    Cancelled,
}

impl Error {
    pub(crate) fn communication(context: &'static str, source: io::Error) -> Self {
        Error::Communication { context, source }
    }

    /// Whether the server reported that the requested object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Server(ServerError::Code(ResponseCode::Nil)))
    }

    /// Whether the error means the connection it happened on cannot be reused.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Communication { .. } => true,
            Error::Protocol(e) => e.is_fatal(),
            Error::Usage(UsageError::ConnectionClosed { .. }) => true,
            _ => false,
        }
    }

    /// Whether the error was raised because the connection is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Usage(UsageError::ConnectionClosed { .. }))
    }

    /// The server response code behind this error, if any.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            Error::Server(ServerError::Code(code)) => Some(*code),
            Error::Server(ServerError::ErrorString(_)) => Some(ResponseCode::ErrorString),
            Error::Protocol(ProtocolError::PacketError) => Some(ResponseCode::PacketError),
            _ => None,
        }
    }
}

/// I/O causes are cloned by kind and message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Usage(e) => Error::Usage(e.clone()),
            Error::Communication { context, source } => Error::Communication {
                context: *context,
                source: io::Error::new(source.kind(), source.to_string()),
            },
            Error::Protocol(e) => Error::Protocol(e.clone()),
            Error::Server(e) => Error::Server(e.clone()),
            Error::VersionMismatch { expected, actual } => Error::VersionMismatch {
                expected: *expected,
                actual: actual.clone(),
            },
            Error::Cancelled => Error::Cancelled,
        }
    }
}

impl From<EncodeError> for Error {
    fn from(e: EncodeError) -> Self {
        Error::Usage(UsageError::Encode(e))
    }
}

// ============================================================================
// Usage Errors
// ============================================================================

/// The caller used the client incorrectly. Never retried.
#[derive(Error, Debug, Clone)]
pub enum UsageError {
    #[error("empty packet (0 action)")]
    EmptyPacket,

    #[error("the connection is already closed")]
    ConnectionClosed {
        #[source]
        cause: Option<Arc<Error>>,
    },

    #[error("incorrect usage: {0}")]
    Encode(#[from] EncodeError),

    #[error("the connection pool is closed")]
    PoolClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("auth provider failed: {0}")]
    AuthProvider(String),
}

/// A value could not be encoded. No bytes are left in the buffer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("{0} cannot be appended without type info")]
    MissingTypeInfo(CompoundType),

    #[error("a flat array cannot contain another array")]
    NestedArray,

    #[error("{0} cannot contain an array")]
    CompoundElement(CompoundType),

    #[error("null element in {0}")]
    NullElement(CompoundType),

    #[error("{found} element in a typed array of {expected}")]
    ElementType { expected: DataType, found: String },

    #[error("{0} is not a valid element type for a typed array")]
    InvalidElementType(DataType),

    #[error("{0} values cannot be sent to the server")]
    UnsupportedValue(&'static str),

    #[error("{0} requires an element type")]
    MissingElementType(CompoundType),
}

// ============================================================================
// Protocol Errors
// ============================================================================

/// The response did not match the shape the client expected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("data length mismatch: declared {declared}, got {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("data type '{0}' not implemented")]
    NotImplemented(char),

    #[error("typed array of {expected} contains a {found} element")]
    ElementTypeMismatch { expected: DataType, found: DataType },

    #[error("null element in a non-null typed array")]
    NullInNonNullArray,

    #[error("read a compound entry (#{index}) in a flat array")]
    CompoundInFlatArray { index: usize },

    #[error("unknown response code {0}")]
    UnknownResponseCode(i64),

    #[error("malformed {data_type} payload {payload:?}")]
    InvalidPayload { data_type: DataType, payload: String },

    #[error("server sent a packet error; the stream is out of sync")]
    PacketError,

    #[error("response has {actual} entries for {expected} actions")]
    EntryCountMismatch { expected: usize, actual: usize },

    #[error("response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("arrays nested deeper than {limit} levels")]
    NestingTooDeep { limit: usize },

    #[error("{action}: unexpected response element: {value}")]
    UnexpectedResponse { action: &'static str, value: String },
}

impl ProtocolError {
    /// Whether the stream can no longer be trusted after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidPacket(_)
                | ProtocolError::ElementTypeMismatch { .. }
                | ProtocolError::NullInNonNullArray
                | ProtocolError::CompoundInFlatArray { .. }
                | ProtocolError::PacketError
                | ProtocolError::EntryCountMismatch { .. }
                | ProtocolError::ResponseTooLarge { .. }
                | ProtocolError::NestingTooDeep { .. }
        )
    }
}

// ============================================================================
// Server Errors
// ============================================================================

/// The server answered with an error code or error text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServerError {
    #[error("skytable response error code: {0}")]
    Code(ResponseCode),

    #[error("skytable response error string: {0}")]
    ErrorString(String),
}
