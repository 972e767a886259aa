//! Skyhash wire protocol implementation.
//!
//! Architecture:
//! - `types`: type tags, response codes and decoded values
//! - `encode`: request encoding into a reusable `BytesMut`
//! - `decode`: batch-at-a-time response decoding from an async stream

pub mod decode;
pub mod encode;
pub mod types;

#[cfg(test)]
mod tests;

/// Protocol version this client implements, as reported by `SYS INFO PROTOCOL`.
pub const PROTOCOL_VERSION: &str = "Skyhash-1.1";

pub use decode::{
    decode_batch, PartialRead, ResponseReader, DEFAULT_MAX_RESPONSE_SIZE, MAX_NESTING_DEPTH,
};
pub use encode::{append_array_header, append_batch_header, append_command, append_value};
pub use types::{
    CompoundType, DataType, ResponseCode, ResponseEntry, TypedArray, Value, WireType,
};
