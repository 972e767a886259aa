//! Skyhash type tags and values.
//!
//! Every entry on the wire starts with a single tag byte. Scalar tags are
//! described by [`DataType`], aggregate tags by [`CompoundType`]. Decoded
//! payloads are represented by the closed [`Value`] enum.

use std::fmt;

use bytes::Bytes;

use crate::error::Error;

// ============================================================================
// Type Tags
// ============================================================================

/// Scalar wire types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    String = b'+',
    ResponseCode = b'!',
    /// Not supported by this client.
    Json = b'$',
    /// Not supported by this client.
    SignedSmallInt = b'-',
    /// Not supported by this client.
    UnsignedSmallInt = b'.',
    SignedInt64 = b';',
    UnsignedInt64 = b':',
    Float32 = b'%',
    BinaryString = b'?',
}

impl DataType {
    /// Look up a scalar type by its tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'+' => Some(DataType::String),
            b'!' => Some(DataType::ResponseCode),
            b'$' => Some(DataType::Json),
            b'-' => Some(DataType::SignedSmallInt),
            b'.' => Some(DataType::UnsignedSmallInt),
            b';' => Some(DataType::SignedInt64),
            b':' => Some(DataType::UnsignedInt64),
            b'%' => Some(DataType::Float32),
            b'?' => Some(DataType::BinaryString),
            _ => None,
        }
    }

    /// The tag byte written on the wire.
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Whether the client can encode and decode payloads of this type.
    pub fn is_supported(self) -> bool {
        !matches!(
            self,
            DataType::Json | DataType::SignedSmallInt | DataType::UnsignedSmallInt
        )
    }

    /// Whether the payload is a byte string whose size is a byte count.
    ///
    /// All other types carry a single line whose size is its character count.
    pub fn is_sized_payload(self) -> bool {
        matches!(
            self,
            DataType::String | DataType::BinaryString | DataType::Json
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::String => "String",
            DataType::ResponseCode => "ResponseCode",
            DataType::Json => "Json",
            DataType::SignedSmallInt => "SignedSmallInt",
            DataType::UnsignedSmallInt => "UnsignedSmallInt",
            DataType::SignedInt64 => "SignedInt64",
            DataType::UnsignedInt64 => "UnsignedInt64",
            DataType::Float32 => "Float32",
            DataType::BinaryString => "BinaryString",
        };
        write!(f, "{} ('{}')", name, self.tag() as char)
    }
}

/// Aggregate wire types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompoundType {
    /// Recursive, heterogeneous.
    Array = b'&',
    /// One level deep, scalar elements only.
    FlatArray = b'_',
    /// Homogeneous, elements may be null.
    TypedArray = b'@',
    /// Heterogeneous, non-null; frames outgoing commands.
    AnyArray = b'~',
    /// Homogeneous, no nulls.
    TypedNonNullArray = b'^',
}

impl CompoundType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'&' => Some(CompoundType::Array),
            b'_' => Some(CompoundType::FlatArray),
            b'@' => Some(CompoundType::TypedArray),
            b'~' => Some(CompoundType::AnyArray),
            b'^' => Some(CompoundType::TypedNonNullArray),
            _ => None,
        }
    }

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Whether the header carries an element type tag.
    pub fn is_typed(self) -> bool {
        matches!(
            self,
            CompoundType::TypedArray | CompoundType::TypedNonNullArray
        )
    }
}

impl fmt::Display for CompoundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompoundType::Array => "Array",
            CompoundType::FlatArray => "FlatArray",
            CompoundType::TypedArray => "TypedArray",
            CompoundType::AnyArray => "AnyArray",
            CompoundType::TypedNonNullArray => "TypedNonNullArray",
        };
        write!(f, "{} ('{}')", name, self.tag() as char)
    }
}

/// The tag an entry was declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    Scalar(DataType),
    Compound(CompoundType),
}

impl WireType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        DataType::from_tag(tag)
            .map(WireType::Scalar)
            .or_else(|| CompoundType::from_tag(tag).map(WireType::Compound))
    }

    pub fn tag(self) -> u8 {
        match self {
            WireType::Scalar(t) => t.tag(),
            WireType::Compound(t) => t.tag(),
        }
    }

    pub fn is_compound(self) -> bool {
        matches!(self, WireType::Compound(_))
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireType::Scalar(t) => t.fmt(f),
            WireType::Compound(t) => t.fmt(f),
        }
    }
}

impl From<DataType> for WireType {
    fn from(t: DataType) -> Self {
        WireType::Scalar(t)
    }
}

impl From<CompoundType> for WireType {
    fn from(t: CompoundType) -> Self {
        WireType::Compound(t)
    }
}

// ============================================================================
// Response Codes
// ============================================================================

/// Response codes returned by the server.
///
/// `ErrorString` and `GenericError` never appear on the wire; the client
/// synthesizes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum ResponseCode {
    /// The server returned free-form error text instead of a numeric code.
    ErrorString = -1,
    GenericError = -2,
    Okay = 0,
    Nil = 1,
    OverwriteError = 2,
    ActionError = 3,
    /// The packet contained invalid data. Never recoverable.
    PacketError = 4,
    ServerError = 5,
    OtherError = 6,
    WrongtypeError = 7,
    UnknownDataType = 8,
    EncodingError = 9,
    BadCredentials = 10,
    AuthnRealmError = 11,
}

impl ResponseCode {
    #[inline]
    pub fn as_i8(self) -> i8 {
        self as i8
    }

    pub fn is_okay(self) -> bool {
        self == ResponseCode::Okay
    }
}

impl TryFrom<i64> for ResponseCode {
    type Error = i64;

    /// Only codes that can appear on the wire are accepted.
    fn try_from(code: i64) -> Result<Self, i64> {
        Ok(match code {
            0 => ResponseCode::Okay,
            1 => ResponseCode::Nil,
            2 => ResponseCode::OverwriteError,
            3 => ResponseCode::ActionError,
            4 => ResponseCode::PacketError,
            5 => ResponseCode::ServerError,
            6 => ResponseCode::OtherError,
            7 => ResponseCode::WrongtypeError,
            8 => ResponseCode::UnknownDataType,
            9 => ResponseCode::EncodingError,
            10 => ResponseCode::BadCredentials,
            11 => ResponseCode::AuthnRealmError,
            other => return Err(other),
        })
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResponseCode::ErrorString => "error string",
            ResponseCode::GenericError => "generic error",
            ResponseCode::Okay => "okay",
            ResponseCode::Nil => "nil",
            ResponseCode::OverwriteError => "overwrite error",
            ResponseCode::ActionError => "action error",
            ResponseCode::PacketError => "packet error",
            ResponseCode::ServerError => "server error",
            ResponseCode::OtherError => "other error",
            ResponseCode::WrongtypeError => "wrongtype error",
            ResponseCode::UnknownDataType => "unknown data type",
            ResponseCode::EncodingError => "encoding error",
            ResponseCode::BadCredentials => "bad credentials",
            ResponseCode::AuthnRealmError => "authn realm error",
        };
        write!(f, "{} ({})", text, self.as_i8())
    }
}

// ============================================================================
// Values
// ============================================================================

/// A value exchanged on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    BinaryString(Bytes),
    UnsignedInt64(u64),
    SignedInt64(i64),
    Float32(f32),
    ResponseCode(ResponseCode),
    /// Free-form error text sent in place of a response code.
    ErrorString(String),
    TypedArray(TypedArray),
    FlatArray(Vec<Value>),
    Array(Vec<Value>),
    AnyArray(Vec<Value>),
    /// An entry whose tag this client does not implement.
    Unsupported(u8),
}

impl Value {
    /// The scalar wire type of this value, if it has one.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::String(_) => Some(DataType::String),
            Value::BinaryString(_) => Some(DataType::BinaryString),
            Value::UnsignedInt64(_) => Some(DataType::UnsignedInt64),
            Value::SignedInt64(_) => Some(DataType::SignedInt64),
            Value::Float32(_) => Some(DataType::Float32),
            Value::ResponseCode(_) | Value::ErrorString(_) => Some(DataType::ResponseCode),
            Value::Unsupported(tag) => DataType::from_tag(*tag),
            _ => None,
        }
    }

    /// The compound wire type of this value, if it is an array.
    pub fn compound_type(&self) -> Option<CompoundType> {
        match self {
            Value::TypedArray(arr) => Some(arr.compound_type()),
            Value::FlatArray(_) => Some(CompoundType::FlatArray),
            Value::Array(_) => Some(CompoundType::Array),
            Value::AnyArray(_) => Some(CompoundType::AnyArray),
            _ => None,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_compound(&self) -> bool {
        self.compound_type().is_some()
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::BinaryString(b) => Some(b),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UnsignedInt64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_response_code(&self) -> Option<ResponseCode> {
        match self {
            Value::ResponseCode(code) => Some(*code),
            Value::ErrorString(_) => Some(ResponseCode::ErrorString),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::String(s) => write!(f, "{:?}", s),
            Value::BinaryString(b) => write!(f, "<{} bytes>", b.len()),
            Value::UnsignedInt64(n) => write!(f, "{}", n),
            Value::SignedInt64(n) => write!(f, "{}", n),
            Value::Float32(n) => write!(f, "{}", n),
            Value::ResponseCode(code) => write!(f, "{}", code),
            Value::ErrorString(s) => write!(f, "error string {:?}", s),
            Value::TypedArray(arr) => write!(
                f,
                "{} of {} ({} elements)",
                arr.compound_type(),
                arr.element_type,
                arr.elements.len()
            ),
            Value::FlatArray(items) => write!(f, "flat array ({} elements)", items.len()),
            Value::Array(items) => write!(f, "array ({} elements)", items.len()),
            Value::AnyArray(items) => write!(f, "any array ({} elements)", items.len()),
            Value::Unsupported(tag) => write!(f, "unsupported '{}'", *tag as char),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::String(s.clone())
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::BinaryString(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::BinaryString(Bytes::from(b))
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::BinaryString(Bytes::copy_from_slice(b))
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Float32(n)
    }
}

impl From<TypedArray> for Value {
    fn from(arr: TypedArray) -> Self {
        Value::TypedArray(arr)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

macro_rules! impl_from_unsigned {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::UnsignedInt64(n as u64)
            }
        })*
    };
}

macro_rules! impl_from_signed {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::SignedInt64(n as i64)
            }
        })*
    };
}

impl_from_unsigned!(u8, u16, u32, u64, usize);
impl_from_signed!(i8, i16, i32, i64, isize);

// ============================================================================
// Typed Arrays
// ============================================================================

/// A homogeneous array tagged with its element type.
///
/// Every non-null element has `element_type` as its wire type; when
/// `non_null` is set no element is [`Value::Null`].
#[derive(Debug, Clone, PartialEq)]
pub struct TypedArray {
    pub element_type: DataType,
    pub non_null: bool,
    pub elements: Vec<Value>,
}

impl TypedArray {
    /// A typed array that may contain nulls.
    pub fn new(element_type: DataType, elements: Vec<Value>) -> Self {
        Self {
            element_type,
            non_null: false,
            elements,
        }
    }

    /// A typed array that must not contain nulls.
    pub fn non_null(element_type: DataType, elements: Vec<Value>) -> Self {
        Self {
            element_type,
            non_null: true,
            elements,
        }
    }

    pub fn compound_type(&self) -> CompoundType {
        if self.non_null {
            CompoundType::TypedNonNullArray
        } else {
            CompoundType::TypedArray
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate over string elements; nulls and other types yield `None`.
    pub fn strings(&self) -> impl Iterator<Item = Option<&str>> {
        self.elements.iter().map(Value::as_str)
    }
}

// ============================================================================
// Response Entries
// ============================================================================

/// One decoded entry of a response batch, produced per action in request order.
#[derive(Debug)]
pub struct ResponseEntry {
    /// The tag the entry was declared with.
    pub declared_type: WireType,
    pub value: Value,
    /// A decode error local to this entry, or the action's validation error.
    pub error: Option<Error>,
}

impl ResponseEntry {
    pub fn new(declared_type: WireType, value: Value) -> Self {
        Self {
            declared_type,
            value,
            error: None,
        }
    }

    pub fn with_error(declared_type: WireType, value: Value, error: Error) -> Self {
        Self {
            declared_type,
            value,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Turn the entry into its value, or its error if it carries one.
    pub fn into_result(self) -> crate::error::Result<Value> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.value),
        }
    }
}
