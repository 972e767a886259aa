//! Tests for the Skyhash codec.

use super::decode::*;
use super::encode::*;
use super::types::*;
use crate::error::{Error, ProtocolError};
use bytes::{Bytes, BytesMut};

/// Decode a buffer that must hold exactly one complete batch.
fn decode_all(buf: &[u8]) -> Vec<ResponseEntry> {
    let (entries, consumed) = decode_batch(buf)
        .expect("batch should decode")
        .expect("batch should be complete");
    assert_eq!(consumed, buf.len(), "batch should consume the whole buffer");
    entries
}

fn decode_err(buf: &[u8]) -> PartialRead {
    match decode_batch(buf) {
        Err(e) => e,
        Ok(other) => panic!("expected a fatal error, got {:?}", other),
    }
}

fn protocol_error(err: &Error) -> &ProtocolError {
    match err {
        Error::Protocol(e) => e,
        other => panic!("expected a protocol error, got {:?}", other),
    }
}

// ============================================================================
// Scenarios
// ============================================================================

mod scenarios {
    use super::*;

    #[test]
    fn test_command_envelope_decodes_as_any_array() {
        let mut buf = BytesMut::new();
        append_batch_header(&mut buf, 1);
        append_command(&mut buf, &["SET".into(), "X".into(), 100u64.into()]).unwrap();

        let entries = decode_all(&buf);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].declared_type,
            WireType::Compound(CompoundType::AnyArray)
        );
        assert_eq!(
            entries[0].value,
            Value::AnyArray(vec!["SET".into(), "X".into(), "100".into()])
        );
        assert!(buf.starts_with(b"*1\n~3\n3\nSET\n1\nX\n3\n100\n"));
    }

    #[test]
    fn test_unsigned_int_entry() {
        let entries = decode_all(b"*1\n:3\n100\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].declared_type,
            WireType::Scalar(DataType::UnsignedInt64)
        );
        assert_eq!(entries[0].value, Value::UnsignedInt64(100));
        assert!(entries[0].error.is_none());
    }

    #[test]
    fn test_response_code_error_string() {
        let entries = decode_all(b"*1\n!18\nerr-already-exists\n");
        assert_eq!(
            entries[0].declared_type,
            WireType::Scalar(DataType::ResponseCode)
        );
        assert_eq!(
            entries[0].value,
            Value::ErrorString("err-already-exists".to_string())
        );
        assert!(entries[0].is_ok());
    }

    #[test]
    fn test_packet_error_aborts_read() {
        let err = decode_err(b"*3\n!1\n0\n!1\n4\n+2\nok\n");
        assert_eq!(protocol_error(&err.error), &ProtocolError::PacketError);
        assert!(err.error.is_fatal());
        // the entry before the packet error is kept for diagnostics
        assert_eq!(err.entries.len(), 1);
        assert_eq!(err.entries[0].value, Value::ResponseCode(ResponseCode::Okay));
    }
}

// ============================================================================
// Scalar Decoding
// ============================================================================

mod scalars {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let values = vec![
            Value::from("hello world"),
            Value::from(""),
            Value::from(Bytes::from_static(b"\x00\x01\n\xff")),
            Value::UnsignedInt64(u64::MAX),
            Value::SignedInt64(i64::MIN),
            Value::Float32(-3.25),
            Value::ResponseCode(ResponseCode::OverwriteError),
        ];

        let mut buf = BytesMut::new();
        append_batch_header(&mut buf, values.len());
        for value in &values {
            append_value(&mut buf, value, true).unwrap();
        }

        let entries = decode_all(&buf);
        assert_eq!(entries.len(), values.len());
        for (entry, value) in entries.iter().zip(&values) {
            assert!(entry.is_ok(), "{:?}", entry);
            assert_eq!(&entry.value, value);
        }
    }

    #[test]
    fn test_binary_payload_may_contain_newlines() {
        let entries = decode_all(b"*1\n?3\na\nb\n");
        assert_eq!(
            entries[0].value,
            Value::BinaryString(Bytes::from_static(b"a\nb"))
        );
    }

    #[test]
    fn test_size_mismatch_is_local() {
        let entries = decode_all(b"*2\n:3\n1000\n+1\na\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, Value::UnsignedInt64(1000));
        assert_eq!(
            protocol_error(entries[0].error.as_ref().unwrap()),
            &ProtocolError::SizeMismatch {
                declared: 3,
                actual: 4
            }
        );
        assert!(entries[1].is_ok());
    }

    #[test]
    fn test_unsupported_type_is_local() {
        let entries = decode_all(b"*3\n$2\n{}\n-2\n-5\n+2\nok\n");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].value, Value::Unsupported(b'$'));
        assert_eq!(
            protocol_error(entries[0].error.as_ref().unwrap()),
            &ProtocolError::NotImplemented('$')
        );
        assert_eq!(entries[1].value, Value::Unsupported(b'-'));
        assert_eq!(entries[2].value, Value::from("ok"));
        assert!(entries[2].is_ok());
    }

    #[test]
    fn test_unknown_response_code_is_local() {
        let entries = decode_all(b"*1\n!2\n42\n");
        assert_eq!(
            protocol_error(entries[0].error.as_ref().unwrap()),
            &ProtocolError::UnknownResponseCode(42)
        );
    }

    #[test]
    fn test_unparsable_number_is_local() {
        let entries = decode_all(b"*1\n:3\nabc\n");
        assert_eq!(entries[0].value, Value::Null);
        assert!(matches!(
            protocol_error(entries[0].error.as_ref().unwrap()),
            ProtocolError::InvalidPayload { .. }
        ));
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let err = decode_err(b"*2\n+1\na\nZ1\nb\n");
        assert_eq!(err.entries.len(), 1);
        assert!(matches!(
            protocol_error(&err.error),
            ProtocolError::InvalidPacket(_)
        ));
    }

    #[test]
    fn test_missing_payload_delimiter_is_fatal() {
        let err = decode_err(b"*1\n+2\nabc\n");
        assert!(matches!(
            protocol_error(&err.error),
            ProtocolError::InvalidPacket(_)
        ));
    }
}

// ============================================================================
// Array Decoding
// ============================================================================

mod arrays {
    use super::*;

    #[test]
    fn test_typed_array_with_nulls() {
        let entries = decode_all(b"*1\n@+3\n1\na\n\0\n2\nbc\n");
        let Value::TypedArray(arr) = &entries[0].value else {
            panic!("expected typed array, got {:?}", entries[0].value);
        };
        assert_eq!(arr.element_type, DataType::String);
        assert!(!arr.non_null);
        assert_eq!(
            arr.strings().collect::<Vec<_>>(),
            vec![Some("a"), None, Some("bc")]
        );
    }

    #[test]
    fn test_typed_array_tolerates_own_element_tag() {
        let entries = decode_all(b"*1\n^:2\n:1\n1\n1\n2\n");
        assert_eq!(
            entries[0].value,
            Value::TypedArray(TypedArray::non_null(
                DataType::UnsignedInt64,
                vec![1u64.into(), 2u64.into()]
            ))
        );
    }

    #[test]
    fn test_typed_array_element_mismatch() {
        let err = decode_err(b"*1\n@:2\n1\n1\n;2\n-1\n");
        assert_eq!(
            protocol_error(&err.error),
            &ProtocolError::ElementTypeMismatch {
                expected: DataType::UnsignedInt64,
                found: DataType::SignedInt64,
            }
        );
        assert!(err.error.is_fatal());
    }

    #[test]
    fn test_non_null_array_rejects_null() {
        let err = decode_err(b"*1\n^+2\n1\na\n\0\n");
        assert_eq!(
            protocol_error(&err.error),
            &ProtocolError::NullInNonNullArray
        );
    }

    #[test]
    fn test_size_mismatch_inside_array_is_fatal() {
        let err = decode_err(b"*1\n@:1\n1\n10\n");
        assert!(matches!(
            protocol_error(&err.error),
            ProtocolError::SizeMismatch { .. }
        ));
    }

    #[test]
    fn test_flat_array() {
        let entries = decode_all(b"*1\n_2\n+1\na\n:1\n7\n");
        assert_eq!(
            entries[0].value,
            Value::FlatArray(vec!["a".into(), 7u64.into()])
        );
    }

    #[test]
    fn test_flat_array_rejects_compound() {
        let err = decode_err(b"*1\n_2\n+1\na\n&0\n");
        assert_eq!(
            protocol_error(&err.error),
            &ProtocolError::CompoundInFlatArray { index: 1 }
        );
    }

    #[test]
    fn test_recursive_array() {
        let entries = decode_all(b"*1\n&3\n+1\na\n_1\n:1\n1\n%3\n0.5\n");
        assert_eq!(
            entries[0].value,
            Value::Array(vec![
                "a".into(),
                Value::FlatArray(vec![1u64.into()]),
                Value::Float32(0.5),
            ])
        );
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |depth: usize| {
            let mut buf = b"*1\n".to_vec();
            buf.extend(b"&1\n".repeat(depth));
            buf.extend_from_slice(b"+1\na\n");
            buf
        };

        let entries = decode_all(&nested(MAX_NESTING_DEPTH));
        assert!(matches!(entries[0].value, Value::Array(_)));

        for depth in [MAX_NESTING_DEPTH + 1, 200_000] {
            let err = decode_err(&nested(depth));
            assert_eq!(
                protocol_error(&err.error),
                &ProtocolError::NestingTooDeep {
                    limit: MAX_NESTING_DEPTH
                }
            );
            assert!(err.error.is_fatal());
        }
    }

    #[test]
    fn test_any_array_binary_element() {
        let entries = decode_all(b"*1\n~2\n1\nk\n2\n\xff\xfe\n");
        assert_eq!(
            entries[0].value,
            Value::AnyArray(vec![
                "k".into(),
                Value::BinaryString(Bytes::from_static(b"\xff\xfe")),
            ])
        );
    }

    #[test]
    fn test_array_round_trip() {
        let value = Value::Array(vec![
            TypedArray::new(DataType::SignedInt64, vec![(-1i64).into(), Value::Null]).into(),
            Value::from("x"),
        ]);
        let mut buf = BytesMut::new();
        append_batch_header(&mut buf, 1);
        append_value(&mut buf, &value, true).unwrap();

        let entries = decode_all(&buf);
        assert_eq!(entries[0].value, value);
    }
}

// ============================================================================
// Batch Framing
// ============================================================================

mod framing {
    use super::*;

    #[test]
    fn test_incomplete_batch() {
        assert!(decode_batch(b"").unwrap().is_none());
        assert!(decode_batch(b"*2\n+1\na\n").unwrap().is_none());
        assert!(decode_batch(b"*1\n+5\nhel").unwrap().is_none());
        assert!(decode_batch(b"*1\n@+2\n1\na\n").unwrap().is_none());
    }

    #[test]
    fn test_invalid_batch_header() {
        let err = decode_err(b"#1\n");
        assert!(matches!(
            protocol_error(&err.error),
            ProtocolError::InvalidPacket(_)
        ));
        let err = decode_err(b"*x\n");
        assert!(matches!(
            protocol_error(&err.error),
            ProtocolError::InvalidPacket(_)
        ));
    }

    #[test]
    fn test_batch_keeps_request_order() {
        let entries = decode_all(b"*3\n!1\n0\n+1\nv\n!1\n1\n");
        let values: Vec<_> = entries.into_iter().map(|e| e.value).collect();
        assert_eq!(
            values,
            vec![
                Value::ResponseCode(ResponseCode::Okay),
                Value::from("v"),
                Value::ResponseCode(ResponseCode::Nil),
            ]
        );
    }

    #[test]
    fn test_trailing_bytes_are_not_consumed() {
        let (entries, consumed) = decode_batch(b"*1\n:1\n1\n*1\n").unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(consumed, 8);
    }
}

// ============================================================================
// Stream Reading
// ============================================================================

mod reader {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_across_chunks() {
        let mut stream = Builder::new()
            .read(b"*2\n+5\nhel")
            .read(b"lo\n:2\n")
            .read(b"42\n")
            .build();
        let mut reader = ResponseReader::new();

        let entries = reader.read(&mut stream).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, Value::from("hello"));
        assert_eq!(entries[1].value, Value::UnsignedInt64(42));
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_pipelined_batches_stay_buffered() {
        let mut stream = Builder::new().read(b"*1\n:1\n1\n*1\n:1\n2\n").build();
        let mut reader = ResponseReader::new();

        let first = reader.read(&mut stream).await.unwrap();
        assert_eq!(first[0].value, Value::UnsignedInt64(1));
        let second = reader.read(&mut stream).await.unwrap();
        assert_eq!(second[0].value, Value::UnsignedInt64(2));
    }

    #[tokio::test]
    async fn test_eof_mid_batch() {
        let mut stream = Builder::new().read(b"*2\n+1\na\n").build();
        let mut reader = ResponseReader::new();

        let err = reader.read(&mut stream).await.unwrap_err();
        assert!(matches!(err.error, Error::Communication { .. }));
        assert!(err.error.is_fatal());
        assert_eq!(err.entries.len(), 1);
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_eof_keeps_decoded_entries() {
        let mut stream = Builder::new()
            .read(b"*3\n+1\na\n")
            .read(b"+1\nb\n+4\nab")
            .build();
        let mut reader = ResponseReader::new();

        let err = reader.read(&mut stream).await.unwrap_err();
        let values: Vec<Value> = err.entries.into_iter().map(|e| e.value).collect();
        assert_eq!(values, vec![Value::from("a"), Value::from("b")]);
    }

    #[tokio::test]
    async fn test_read_one_byte_at_a_time() {
        let batch: &[u8] = b"*4\n&2\n+1\na\n_1\n:1\n7\n@;3\n;2\n-1\n\0\n2\n15\n~2\n1\nx\n1\ny\n!1\n0\n";
        let mut builder = Builder::new();
        for byte in batch {
            builder.read(std::slice::from_ref(byte));
        }
        let mut stream = builder.build();
        let mut reader = ResponseReader::new();

        let entries = reader.read(&mut stream).await.unwrap();
        let values: Vec<Value> = entries.iter().map(|e| e.value.clone()).collect();
        let expected: Vec<Value> = decode_all(batch).into_iter().map(|e| e.value).collect();
        assert_eq!(values, expected);
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(ResponseEntry::is_ok));
        assert_eq!(
            entries[1].value,
            TypedArray::new(
                DataType::SignedInt64,
                vec![(-1i64).into(), Value::Null, 15i64.into()]
            )
            .into()
        );
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_deep_nesting_from_stream() {
        let mut batch = b"*1\n".to_vec();
        batch.extend(b"&1\n".repeat(1_000));
        let mut stream = Builder::new().read(&batch).build();
        let mut reader = ResponseReader::new();

        let err = reader.read(&mut stream).await.unwrap_err();
        assert_eq!(
            protocol_error(&err.error),
            &ProtocolError::NestingTooDeep {
                limit: MAX_NESTING_DEPTH
            }
        );
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_response_too_large() {
        let mut stream = Builder::new().read(b"*2\n+1\na\n+100\naaaaaaaaaa").build();
        let mut reader = ResponseReader::with_max_size(16);

        let err = reader.read(&mut stream).await.unwrap_err();
        assert_eq!(
            protocol_error(&err.error),
            &ProtocolError::ResponseTooLarge { limit: 16 }
        );
        assert_eq!(err.entries.len(), 1);
        assert_eq!(reader.buffered(), 0);
    }
}
