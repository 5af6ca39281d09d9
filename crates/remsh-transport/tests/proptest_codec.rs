//! Property tests for the wire codec and framing.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use remsh_transport::codec::{decode, encode, WireCodec};
use remsh_transport::protocol::{decode_frame, encode_frame, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
use remsh_transport::{Body, FrameError, Message, MessageId, ResponseKind, StreamKind};
use uuid::Uuid;

fn roundtrip<T: WireCodec + PartialEq + std::fmt::Debug>(value: T) -> Result<(), TestCaseError> {
    let mut buf = BytesMut::new();
    encode(&mut buf, &value);
    let mut bytes = buf.freeze();
    let decoded: T = decode(&mut bytes).map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert_eq!(decoded, value);
    prop_assert!(bytes.is_empty());
    Ok(())
}

fn bytes_strategy() -> impl Strategy<Value = Bytes> {
    proptest::collection::vec(any::<u8>(), 0..512).prop_map(Bytes::from)
}

fn body_strategy() -> impl Strategy<Value = Body> {
    let response_kind = prop_oneof![
        Just(ResponseKind::Normal),
        Just(ResponseKind::Partial),
        Just(ResponseKind::Fault),
    ];
    let stream_kind = prop_oneof![
        Just(StreamKind::Input),
        Just(StreamKind::Output),
        Just(StreamKind::Error),
    ];
    prop_oneof![
        bytes_strategy().prop_map(|public_key| Body::Handshake { public_key }),
        bytes_strategy().prop_map(|server_public_key| Body::HandshakeResult { server_public_key }),
        (".{0,32}", bytes_strategy(), any::<bool>()).prop_map(|(username, password, encrypted)| Body::Login {
            username,
            password,
            encrypted,
        }),
        bytes_strategy().prop_map(|token| Body::LoginSuccess { token }),
        ".{0,64}".prop_map(|reason| Body::LoginFailure { reason }),
        ("[a-z]{1,12}", proptest::option::of(bytes_strategy())).prop_map(|(op, body)| Body::Request { op, body }),
        (response_kind, "[a-z]{1,12}", proptest::option::of(bytes_strategy()))
            .prop_map(|(kind, op, body)| Body::Response { kind, op, body }),
        ".{0,64}".prop_map(|reason| Body::Fault { reason }),
        (stream_kind, bytes_strategy()).prop_map(|(stream, data)| Body::Stream { stream, data }),
    ]
}

fn message_strategy() -> impl Strategy<Value = Message> {
    (body_strategy(), proptest::option::of(any::<u128>()), any::<i64>(), any::<i64>()).prop_map(
        |(body, correlation, sequence, timestamp)| {
            let mut message = Message::new(body);
            message
                .set_correlation_id(correlation.map(|c| MessageId::from_uuid(Uuid::from_u128(c))))
                .unwrap();
            message.set_sequence(sequence).unwrap();
            message.set_timestamp(timestamp).unwrap();
            message
        },
    )
}

proptest! {
    #[test]
    fn prop_i32(value in any::<i32>()) {
        roundtrip(value)?;
    }

    #[test]
    fn prop_i64(value in any::<i64>()) {
        roundtrip(value)?;
    }

    #[test]
    fn prop_bool(value in any::<bool>()) {
        roundtrip(value)?;
    }

    #[test]
    fn prop_string(value in ".{0,128}") {
        roundtrip(value)?;
    }

    #[test]
    fn prop_optional_string(value in proptest::option::of(".{0,64}")) {
        roundtrip(value)?;
    }

    #[test]
    fn prop_bytes(value in bytes_strategy()) {
        roundtrip(value)?;
    }

    #[test]
    fn prop_optional_bytes(value in proptest::option::of(bytes_strategy())) {
        roundtrip(value)?;
    }

    #[test]
    fn prop_uuid(value in any::<u128>()) {
        roundtrip(Uuid::from_u128(value))?;
    }

    #[test]
    fn prop_message_through_frame(message in message_strategy()) {
        let frame = encode_frame(&message, DEFAULT_MAX_FRAME_SIZE).unwrap();
        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        prop_assert_eq!(length + LENGTH_PREFIX_SIZE, frame.len());
        let decoded = decode_frame(frame.slice(LENGTH_PREFIX_SIZE..)).unwrap();
        prop_assert_eq!(decoded, message);
    }

    #[test]
    fn prop_truncated_message_rejected(message in message_strategy(), cut in any::<prop::sample::Index>()) {
        let encoded = message.to_bytes();
        let cut = cut.index(encoded.len());
        prop_assert!(Message::from_bytes(encoded.slice(..cut)).is_err());
    }

    #[test]
    fn prop_trailing_bytes_rejected(message in message_strategy(), extra in 1usize..16) {
        let mut encoded = BytesMut::from(&message.to_bytes()[..]);
        encoded.extend_from_slice(&vec![0u8; extra]);
        prop_assert_eq!(
            Message::from_bytes(encoded.freeze()),
            Err(FrameError::TrailingBytes(extra))
        );
    }
}
