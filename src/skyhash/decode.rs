//! Skyhash response decoding.
//!
//! A response is a batch: `*<count>\n` followed by `count` entries. The
//! [`ResponseReader`] buffers bytes from the stream until a complete batch can
//! be parsed, then hands back one [`ResponseEntry`] per entry.
//!
//! Errors come in two strengths. Local errors (a size that does not match its
//! payload, an unknown response code, an unsupported type) are attached to the
//! entry and reading continues. Fatal errors (malformed framing, a packet
//! error from the server, a broken array invariant) abort the whole read,
//! since the rest of the stream can no longer be trusted.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use super::types::{
    CompoundType, DataType, ResponseCode, ResponseEntry, TypedArray, Value, WireType,
};
use crate::error::{Error, ProtocolError};

/// Default upper bound on the size of one buffered response (64 MiB).
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// Arrays nested deeper than this are rejected.
pub const MAX_NESTING_DEPTH: usize = 128;

const READ_CHUNK: usize = 8 * 1024;

/// A read that failed after decoding `entries`.
///
/// The entries are diagnostic only; the batch as a whole has failed.
#[derive(Debug, Error)]
#[error("{error} (after {} decoded entries)", .entries.len())]
pub struct PartialRead {
    pub entries: Vec<ResponseEntry>,
    pub error: Error,
}

impl PartialRead {
    fn new(entries: Vec<ResponseEntry>, error: Error) -> Self {
        Self { entries, error }
    }
}

impl From<PartialRead> for Error {
    fn from(e: PartialRead) -> Self {
        e.error
    }
}

// ============================================================================
// Response Reader
// ============================================================================

/// Reads complete response batches from a byte stream.
///
/// Incoming bytes are first checked for framing by a scan that resumes where
/// the previous chunk left off; a batch is decoded once, when its last
/// byte has arrived. Bytes received past the end of a batch stay buffered for
/// the next read.
#[derive(Debug)]
pub struct ResponseReader {
    buf: BytesMut,
    scan: Scan,
    max_response_size: usize,
}

impl Default for ResponseReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseReader {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_RESPONSE_SIZE)
    }

    pub fn with_max_size(max_response_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            scan: Scan::default(),
            max_response_size,
        }
    }

    /// Read exactly one batch from `stream`.
    ///
    /// On failure the entries that were complete before the error are
    /// returned alongside it.
    pub async fn read<R>(&mut self, stream: &mut R) -> Result<Vec<ResponseEntry>, PartialRead>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if self.scan.advance(&self.buf) {
                self.scan = Scan::default();
                match decode_batch(&self.buf) {
                    Ok(Some((entries, consumed))) => {
                        self.buf.advance(consumed);
                        for (index, entry) in entries.iter().enumerate() {
                            trace!(
                                index,
                                declared = %entry.declared_type,
                                ok = entry.is_ok(),
                                "decoded response entry"
                            );
                        }
                        return Ok(entries);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.reset();
                        return Err(e);
                    }
                }
            }

            if self.buf.len() >= self.max_response_size {
                let limit = self.max_response_size;
                return Err(self.abort(ProtocolError::ResponseTooLarge { limit }.into()));
            }

            self.buf.reserve(READ_CHUNK);
            let read = stream.read_buf(&mut self.buf).await;
            let n = match read {
                Ok(n) => n,
                Err(e) => return Err(self.abort(Error::communication("failed to read from conn", e))),
            };
            if n == 0 {
                return Err(self.abort(Error::communication(
                    "connection closed by server",
                    std::io::ErrorKind::UnexpectedEof.into(),
                )));
            }
        }
    }

    /// Give up on the buffered batch, keeping its complete entries.
    fn abort(&mut self, error: Error) -> PartialRead {
        let entries = decoded_prefix(&self.buf);
        self.reset();
        PartialRead::new(entries, error)
    }

    /// Drop any buffered bytes.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scan = Scan::default();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// ============================================================================
// Batch Parser
// ============================================================================

/// Parse one batch from the start of `buf`.
///
/// Returns `Ok(None)` if more bytes are needed, otherwise the entries and the
/// number of bytes they occupied.
pub fn decode_batch(buf: &[u8]) -> Result<Option<(Vec<ResponseEntry>, usize)>, PartialRead> {
    let mut cur = Cursor::new(buf);
    let mut entries = Vec::new();

    let count = match batch_header(&mut cur) {
        Ok(count) => count,
        Err(Fault::Incomplete) => return Ok(None),
        Err(Fault::Fatal(e)) => return Err(PartialRead::new(entries, e.into())),
    };

    entries.reserve(count.min(1024));
    for _ in 0..count {
        match entry(&mut cur) {
            Ok(entry) => entries.push(entry),
            Err(Fault::Incomplete) => return Ok(None),
            Err(Fault::Fatal(e)) => return Err(PartialRead::new(entries, e.into())),
        }
    }
    Ok(Some((entries, cur.pos)))
}

/// The complete entries at the start of a batch that was cut short.
fn decoded_prefix(buf: &[u8]) -> Vec<ResponseEntry> {
    let mut cur = Cursor::new(buf);
    let mut entries = Vec::new();
    if let Ok(count) = batch_header(&mut cur) {
        while entries.len() < count {
            match entry(&mut cur) {
                Ok(entry) => entries.push(entry),
                Err(_) => break,
            }
        }
    }
    entries
}

/// Why parsing stopped.
enum Fault {
    /// The buffer ends before the batch does.
    Incomplete,
    Fatal(ProtocolError),
}

impl From<ProtocolError> for Fault {
    fn from(e: ProtocolError) -> Self {
        Fault::Fatal(e)
    }
}

type Parse<T> = Result<T, Fault>;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> Parse<u8> {
        let b = *self.buf.get(self.pos).ok_or(Fault::Incomplete)?;
        self.pos += 1;
        Ok(b)
    }

    /// The bytes up to the next newline, which is consumed.
    fn line(&mut self) -> Parse<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(Fault::Incomplete)?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    fn take(&mut self, n: usize) -> Parse<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Fault::Incomplete);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn expect_newline(&mut self) -> Parse<()> {
        match self.byte()? {
            b'\n' => Ok(()),
            other => Err(invalid(format!(
                "expected newline after payload, got {:?}",
                other as char
            ))),
        }
    }
}

fn invalid(msg: impl Into<String>) -> Fault {
    Fault::Fatal(ProtocolError::InvalidPacket(msg.into()))
}

fn parse_count(line: &[u8], what: &str) -> Parse<usize> {
    std::str::from_utf8(line)
        .ok()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid(format!("invalid {} {:?}", what, String::from_utf8_lossy(line))))
}

fn batch_header(cur: &mut Cursor<'_>) -> Parse<usize> {
    match cur.byte()? {
        b'*' => parse_count(cur.line()?, "batch size"),
        other => Err(invalid(format!(
            "batch must start with '*', got {:?}",
            other as char
        ))),
    }
}

fn wire_type(tag: u8) -> Parse<WireType> {
    WireType::from_tag(tag).ok_or_else(|| invalid(format!("unknown type tag {:?}", tag as char)))
}

/// A top-level entry. Scalar errors stay local to the entry.
fn entry(cur: &mut Cursor<'_>) -> Parse<ResponseEntry> {
    let declared = wire_type(cur.byte()?)?;
    match declared {
        WireType::Scalar(data_type) => {
            let size = parse_count(cur.line()?, "payload size")?;
            let (value, local) = scalar(cur, data_type, size)?;
            Ok(match local {
                Some(e) => ResponseEntry::with_error(declared, value, e.into()),
                None => ResponseEntry::new(declared, value),
            })
        }
        WireType::Compound(compound) => {
            let value = compound_value(cur, compound, 1)?;
            Ok(ResponseEntry::new(declared, value))
        }
    }
}

/// A tagged element nested inside an array at `depth`. Every error is fatal
/// here.
fn nested_value(cur: &mut Cursor<'_>, depth: usize) -> Parse<Value> {
    match wire_type(cur.byte()?)? {
        WireType::Scalar(data_type) => {
            let size = parse_count(cur.line()?, "payload size")?;
            match scalar(cur, data_type, size)? {
                (_, Some(e)) => Err(Fault::Fatal(e)),
                (value, None) => Ok(value),
            }
        }
        WireType::Compound(compound) => compound_value(cur, compound, depth + 1),
    }
}

/// Decode a scalar payload of `size` whose header line was already read.
///
/// The second element is a local error for the caller to attach or escalate.
fn scalar(
    cur: &mut Cursor<'_>,
    data_type: DataType,
    size: usize,
) -> Parse<(Value, Option<ProtocolError>)> {
    if data_type.is_sized_payload() {
        let payload = cur.take(size)?;
        cur.expect_newline()?;
        return Ok(match data_type {
            DataType::String => match std::str::from_utf8(payload) {
                Ok(s) => (Value::String(s.to_string()), None),
                Err(_) => (
                    Value::BinaryString(Bytes::copy_from_slice(payload)),
                    Some(ProtocolError::InvalidPayload {
                        data_type,
                        payload: String::from_utf8_lossy(payload).into_owned(),
                    }),
                ),
            },
            DataType::BinaryString => (Value::BinaryString(Bytes::copy_from_slice(payload)), None),
            _ => not_implemented(data_type),
        });
    }

    let line = cur.line()?;
    if !data_type.is_supported() {
        return Ok(not_implemented(data_type));
    }
    if data_type == DataType::ResponseCode {
        return response_code(line, size);
    }

    let size_error = (line.len() != size).then_some(ProtocolError::SizeMismatch {
        declared: size,
        actual: line.len(),
    });
    let text = std::str::from_utf8(line).unwrap_or_default();
    let parsed = match data_type {
        DataType::UnsignedInt64 => text.parse().ok().map(Value::UnsignedInt64),
        DataType::SignedInt64 => text.parse().ok().map(Value::SignedInt64),
        DataType::Float32 => text.parse().ok().map(Value::Float32),
        _ => None,
    };
    Ok(match parsed {
        Some(value) => (value, size_error),
        None => (
            Value::Null,
            Some(ProtocolError::InvalidPayload {
                data_type,
                payload: String::from_utf8_lossy(line).into_owned(),
            }),
        ),
    })
}

fn not_implemented(data_type: DataType) -> (Value, Option<ProtocolError>) {
    (
        Value::Unsupported(data_type.tag()),
        Some(ProtocolError::NotImplemented(data_type.tag() as char)),
    )
}

/// A numeric payload is a code; anything else is error text from the server.
fn response_code(line: &[u8], size: usize) -> Parse<(Value, Option<ProtocolError>)> {
    let numeric = !line.is_empty() && line.iter().all(u8::is_ascii_digit);
    if !numeric {
        let text = String::from_utf8_lossy(line).into_owned();
        return Ok((Value::ErrorString(text), None));
    }

    let code = std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(i64::MAX);
    match ResponseCode::try_from(code) {
        Ok(ResponseCode::PacketError) => Err(Fault::Fatal(ProtocolError::PacketError)),
        Ok(code) if line.len() == size => Ok((Value::ResponseCode(code), None)),
        Ok(code) => Ok((
            Value::ResponseCode(code),
            Some(ProtocolError::SizeMismatch {
                declared: size,
                actual: line.len(),
            }),
        )),
        Err(unknown) => Ok((Value::Null, Some(ProtocolError::UnknownResponseCode(unknown)))),
    }
}

/// An array whose tag was already read. Top-level arrays are at depth 1.
fn compound_value(cur: &mut Cursor<'_>, compound: CompoundType, depth: usize) -> Parse<Value> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ProtocolError::NestingTooDeep {
            limit: MAX_NESTING_DEPTH,
        }
        .into());
    }
    match compound {
        CompoundType::TypedArray | CompoundType::TypedNonNullArray => {
            typed_array(cur, compound == CompoundType::TypedNonNullArray)
        }
        CompoundType::FlatArray => {
            let count = parse_count(cur.line()?, "array length")?;
            let mut items = Vec::with_capacity(count.min(1024));
            for index in 0..count {
                let data_type = match wire_type(cur.byte()?)? {
                    WireType::Scalar(t) => t,
                    WireType::Compound(_) => {
                        return Err(ProtocolError::CompoundInFlatArray { index }.into());
                    }
                };
                let size = parse_count(cur.line()?, "payload size")?;
                match scalar(cur, data_type, size)? {
                    (_, Some(e)) => return Err(Fault::Fatal(e)),
                    (value, None) => items.push(value),
                }
            }
            Ok(Value::FlatArray(items))
        }
        CompoundType::Array => {
            let count = parse_count(cur.line()?, "array length")?;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(nested_value(cur, depth)?);
            }
            Ok(Value::Array(items))
        }
        CompoundType::AnyArray => {
            let count = parse_count(cur.line()?, "array length")?;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let size = parse_count(cur.line()?, "element size")?;
                let payload = cur.take(size)?;
                cur.expect_newline()?;
                items.push(match std::str::from_utf8(payload) {
                    Ok(s) => Value::String(s.to_string()),
                    Err(_) => Value::BinaryString(Bytes::copy_from_slice(payload)),
                });
            }
            Ok(Value::AnyArray(items))
        }
    }
}

/// `<elementTag><count>\n` followed by `count` untyped elements of that type.
fn typed_array(cur: &mut Cursor<'_>, non_null: bool) -> Parse<Value> {
    let header = cur.line()?;
    let Some((&tag, count)) = header.split_first() else {
        return Err(invalid("typed array header without element type"));
    };
    let element_type = DataType::from_tag(tag)
        .ok_or_else(|| invalid(format!("invalid element type {:?}", tag as char)))?;
    if !element_type.is_supported() {
        return Err(ProtocolError::NotImplemented(tag as char).into());
    }
    let count = parse_count(count, "array length")?;

    let mut elements = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let line = cur.line()?;
        if line == b"\0" {
            if non_null {
                return Err(ProtocolError::NullInNonNullArray.into());
            }
            elements.push(Value::Null);
            continue;
        }

        let size_line = match line.split_first() {
            Some((&first, rest)) if first == element_type.tag() => rest,
            Some((&first, _)) => match DataType::from_tag(first) {
                Some(found) => {
                    return Err(ProtocolError::ElementTypeMismatch {
                        expected: element_type,
                        found,
                    }
                    .into());
                }
                None => line,
            },
            None => line,
        };
        let size = parse_count(size_line, "element size")?;
        match scalar(cur, element_type, size)? {
            (_, Some(e)) => return Err(Fault::Fatal(e)),
            (value, None) => elements.push(value),
        }
    }

    let arr = if non_null {
        TypedArray::non_null(element_type, elements)
    } else {
        TypedArray::new(element_type, elements)
    };
    Ok(Value::TypedArray(arr))
}

// ============================================================================
// Framing Scan
// ============================================================================

/// How far into a partially received batch the bytes are known to be
/// complete.
///
/// Each call to [`Scan::advance`] resumes at the end of the last complete
/// item, so a batch arriving in many chunks is checked in linear time.
/// Nesting is tracked on an explicit stack rather than by recursion.
#[derive(Debug, Default)]
struct Scan {
    /// End of the last complete item
    pos: usize,
    /// Top-level entries still expected; `None` until the header is read
    remaining: Option<usize>,
    stack: Vec<Frame>,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    kind: FrameKind,
    remaining: usize,
}

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    /// Tagged elements of any type
    Array,
    /// Tagged scalar elements
    Flat,
    /// Untagged byte strings
    Any,
    /// Untagged elements of one type, or null markers
    Typed(DataType),
}

impl Scan {
    /// Scan newly buffered bytes. Returns `true` once the batch is complete
    /// or malformed, i.e. when it is worth handing to [`decode_batch`].
    fn advance(&mut self, buf: &[u8]) -> bool {
        loop {
            let mut cur = Cursor {
                buf,
                pos: self.pos,
            };
            match self.step(&mut cur) {
                Ok(done) => {
                    self.pos = cur.pos;
                    if done {
                        return true;
                    }
                }
                Err(Fault::Incomplete) => return false,
                Err(Fault::Fatal(_)) => return true,
            }
        }
    }

    /// Consume one complete item. State only changes once the item's bytes
    /// are all present.
    fn step(&mut self, cur: &mut Cursor<'_>) -> Parse<bool> {
        if self.remaining.is_none() {
            let count = batch_header(cur)?;
            self.remaining = Some(count);
            return Ok(count == 0);
        }

        let kind = self.stack.last().map(|frame| frame.kind);
        match kind {
            Some(FrameKind::Typed(element_type)) => skip_typed_element(cur, element_type)?,
            Some(FrameKind::Any) => {
                let size = parse_count(cur.line()?, "element size")?;
                cur.take(size)?;
                cur.expect_newline()?;
            }
            Some(FrameKind::Flat) => match wire_type(cur.byte()?)? {
                WireType::Scalar(data_type) => skip_scalar(cur, data_type)?,
                WireType::Compound(_) => return Err(invalid("array inside a flat array")),
            },
            Some(FrameKind::Array) | None => match wire_type(cur.byte()?)? {
                WireType::Scalar(data_type) => skip_scalar(cur, data_type)?,
                WireType::Compound(compound) => {
                    let frame = frame_header(cur, compound)?;
                    if self.stack.len() >= MAX_NESTING_DEPTH {
                        return Err(ProtocolError::NestingTooDeep {
                            limit: MAX_NESTING_DEPTH,
                        }
                        .into());
                    }
                    if frame.remaining > 0 {
                        self.stack.push(frame);
                        return Ok(false);
                    }
                }
            },
        }
        Ok(self.finish_item())
    }

    /// Count one finished item against the enclosing arrays. Returns `true`
    /// when it was the last entry of the batch.
    fn finish_item(&mut self) -> bool {
        while let Some(frame) = self.stack.last_mut() {
            frame.remaining -= 1;
            if frame.remaining > 0 {
                return false;
            }
            self.stack.pop();
        }
        let remaining = self.remaining.unwrap_or(1).saturating_sub(1);
        self.remaining = Some(remaining);
        remaining == 0
    }
}

fn frame_header(cur: &mut Cursor<'_>, compound: CompoundType) -> Parse<Frame> {
    let line = cur.line()?;
    let (kind, count) = match compound {
        CompoundType::TypedArray | CompoundType::TypedNonNullArray => {
            let Some((&tag, count)) = line.split_first() else {
                return Err(invalid("typed array header without element type"));
            };
            match DataType::from_tag(tag) {
                Some(element_type) if element_type.is_supported() => {
                    (FrameKind::Typed(element_type), count)
                }
                _ => return Err(invalid(format!("invalid element type {:?}", tag as char))),
            }
        }
        CompoundType::Array => (FrameKind::Array, line),
        CompoundType::FlatArray => (FrameKind::Flat, line),
        CompoundType::AnyArray => (FrameKind::Any, line),
    };
    Ok(Frame {
        kind,
        remaining: parse_count(count, "array length")?,
    })
}

/// A scalar whose tag was already read.
fn skip_scalar(cur: &mut Cursor<'_>, data_type: DataType) -> Parse<()> {
    let size = parse_count(cur.line()?, "payload size")?;
    skip_payload(cur, data_type, size)
}

fn skip_payload(cur: &mut Cursor<'_>, data_type: DataType, size: usize) -> Parse<()> {
    if data_type.is_sized_payload() {
        cur.take(size)?;
        cur.expect_newline()
    } else {
        cur.line().map(|_| ())
    }
}

fn skip_typed_element(cur: &mut Cursor<'_>, element_type: DataType) -> Parse<()> {
    let line = cur.line()?;
    if line == b"\0" {
        return Ok(());
    }
    let size_line = match line.split_first() {
        Some((&first, rest)) if first == element_type.tag() => rest,
        _ => line,
    };
    let size = parse_count(size_line, "element size")?;
    skip_payload(cur, element_type, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_resumes_after_last_complete_item() {
        let batch: &[u8] = b"*2\n&2\n+1\na\n@:2\n1\n7\n\0\n~1\n2\nhi\n";
        let mut scan = Scan::default();

        assert!(!scan.advance(&batch[..9]));
        assert_eq!(scan.pos, 6);
        assert_eq!(scan.stack.len(), 1);

        assert!(!scan.advance(&batch[..19]));
        assert_eq!(scan.pos, 19);
        assert_eq!(scan.stack.len(), 2);

        assert!(!scan.advance(&batch[..28]));
        assert_eq!(scan.pos, 24);
        assert_eq!(scan.remaining, Some(1));
        assert_eq!(scan.stack.len(), 1);

        assert!(scan.advance(batch));
        assert_eq!(scan.pos, batch.len());
    }

    #[test]
    fn test_scan_stops_on_malformed_bytes() {
        let mut scan = Scan::default();
        assert!(scan.advance(b"*1\n#"));

        let mut scan = Scan::default();
        let mut deep = b"*1\n".to_vec();
        deep.extend(b"&1\n".repeat(MAX_NESTING_DEPTH + 1));
        assert!(scan.advance(&deep));
        assert_eq!(scan.stack.len(), MAX_NESTING_DEPTH);
    }

    #[test]
    fn test_empty_arrays_complete_immediately() {
        let mut scan = Scan::default();
        assert!(scan.advance(b"*2\n&0\n@+0\n"));
    }
}
