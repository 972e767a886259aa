//! Skyhash request encoding.
//!
//! Scalars are written as `[<tag>]<size>\n<payload>\n`, where the tag is only
//! present in typed contexts. Arrays are written as a header line followed by
//! their elements. Every public function here either appends a complete
//! encoding or leaves the buffer exactly as it found it.

use bytes::{BufMut, BytesMut};

use super::types::{CompoundType, DataType, TypedArray, Value};
use crate::error::EncodeError;

/// Marker line written for a null typed-array element.
pub const NULL_MARKER: &[u8] = b"\0\n";

/// Append one value to `buf`.
///
/// `typed` controls whether scalars carry their tag byte. Arrays can only be
/// appended in typed contexts, since their header starts with a tag.
pub fn append_value(buf: &mut BytesMut, value: &Value, typed: bool) -> Result<(), EncodeError> {
    let start = buf.len();
    let result = write_value(buf, value, typed);
    if result.is_err() {
        buf.truncate(start);
    }
    result
}

/// Append an array header.
///
/// `element_type` is required for typed arrays and ignored otherwise.
pub fn append_array_header(
    buf: &mut BytesMut,
    compound: CompoundType,
    element_type: Option<DataType>,
    count: usize,
) -> Result<(), EncodeError> {
    buf.put_u8(compound.tag());
    if compound.is_typed() {
        let Some(element_type) = element_type else {
            buf.truncate(buf.len() - 1);
            return Err(EncodeError::MissingElementType(compound));
        };
        if !is_valid_element_type(element_type) {
            buf.truncate(buf.len() - 1);
            return Err(EncodeError::InvalidElementType(element_type));
        }
        buf.put_u8(element_type.tag());
    }
    put_line(buf, count.to_string().as_bytes());
    Ok(())
}

/// Append the `*<count>\n` header that opens a batch of `count` queries.
pub fn append_batch_header(buf: &mut BytesMut, count: usize) {
    buf.put_u8(b'*');
    put_line(buf, count.to_string().as_bytes());
}

/// Append a command envelope: an any-array whose first segment is the verb.
///
/// ```text
/// ["SET", "X", 100]  =>  ~3\n3\nSET\n1\nX\n3\n100\n
/// ```
pub fn append_command(buf: &mut BytesMut, segments: &[Value]) -> Result<(), EncodeError> {
    let start = buf.len();
    let result = write_any_array(buf, segments);
    if result.is_err() {
        buf.truncate(start);
    }
    result
}

fn write_value(buf: &mut BytesMut, value: &Value, typed: bool) -> Result<(), EncodeError> {
    if let Some(compound) = value.compound_type() {
        if !typed {
            return Err(EncodeError::MissingTypeInfo(compound));
        }
    }

    match value {
        Value::Null => return Err(EncodeError::UnsupportedValue("null")),
        Value::String(s) => write_sized(buf, DataType::String, s.as_bytes(), typed),
        Value::BinaryString(b) => write_sized(buf, DataType::BinaryString, b, typed),
        Value::UnsignedInt64(n) => write_line(buf, DataType::UnsignedInt64, &n.to_string(), typed),
        Value::SignedInt64(n) => write_line(buf, DataType::SignedInt64, &n.to_string(), typed),
        Value::Float32(n) => write_line(buf, DataType::Float32, &n.to_string(), typed),
        Value::ResponseCode(code) => {
            write_line(buf, DataType::ResponseCode, &code.as_i8().to_string(), typed)
        }
        Value::ErrorString(s) => write_line(buf, DataType::ResponseCode, s, typed),
        Value::TypedArray(arr) => write_typed_array(buf, arr)?,
        Value::Array(items) => {
            append_array_header(buf, CompoundType::Array, None, items.len())?;
            for item in items {
                if item.is_null() {
                    return Err(EncodeError::NullElement(CompoundType::Array));
                }
                write_value(buf, item, true)?;
            }
        }
        Value::FlatArray(items) => {
            append_array_header(buf, CompoundType::FlatArray, None, items.len())?;
            for item in items {
                if item.is_compound() {
                    return Err(EncodeError::NestedArray);
                }
                if item.is_null() {
                    return Err(EncodeError::NullElement(CompoundType::FlatArray));
                }
                write_value(buf, item, false)?;
            }
        }
        Value::AnyArray(items) => write_any_array(buf, items)?,
        Value::Unsupported(_) => return Err(EncodeError::UnsupportedValue("unsupported")),
    }
    Ok(())
}

fn write_typed_array(buf: &mut BytesMut, arr: &TypedArray) -> Result<(), EncodeError> {
    let compound = arr.compound_type();
    append_array_header(buf, compound, Some(arr.element_type), arr.len())?;

    for element in &arr.elements {
        match element {
            Value::Null if arr.non_null => return Err(EncodeError::NullElement(compound)),
            Value::Null => buf.put_slice(NULL_MARKER),
            _ if element.is_compound() => return Err(EncodeError::CompoundElement(compound)),
            _ => {
                if element.data_type() != Some(arr.element_type) {
                    return Err(EncodeError::ElementType {
                        expected: arr.element_type,
                        found: element.to_string(),
                    });
                }
                write_value(buf, element, false)?;
            }
        }
    }
    Ok(())
}

fn write_any_array(buf: &mut BytesMut, items: &[Value]) -> Result<(), EncodeError> {
    append_array_header(buf, CompoundType::AnyArray, None, items.len())?;
    for item in items {
        if item.is_null() {
            return Err(EncodeError::NullElement(CompoundType::AnyArray));
        }
        if item.is_compound() {
            return Err(EncodeError::CompoundElement(CompoundType::AnyArray));
        }
        write_value(buf, item, false)?;
    }
    Ok(())
}

/// Byte strings: the size counts payload bytes, the newline follows separately.
fn write_sized(buf: &mut BytesMut, data_type: DataType, payload: &[u8], typed: bool) {
    if typed {
        buf.put_u8(data_type.tag());
    }
    put_line(buf, payload.len().to_string().as_bytes());
    put_line(buf, payload);
}

/// Numbers and response codes: one payload line, sized by its length.
fn write_line(buf: &mut BytesMut, data_type: DataType, payload: &str, typed: bool) {
    write_sized(buf, data_type, payload.as_bytes(), typed);
}

#[inline]
fn put_line(buf: &mut BytesMut, line: &[u8]) {
    buf.put_slice(line);
    buf.put_u8(b'\n');
}

fn is_valid_element_type(data_type: DataType) -> bool {
    data_type.is_supported() && data_type != DataType::ResponseCode
}
