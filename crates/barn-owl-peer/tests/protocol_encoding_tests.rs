//! Protocol encoding/decoding tests
//!
//! NIST 800-53: SI-10 (Input Validation), SI-11 (Error Handling)
//! Implementation: Frame layout, type discriminators and malformed input

use barn_owl_peer::Error;
use barn_owl_peer::protocol::{
    InboundFileTransfer, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, Payload, PayloadShape, Request,
    RequestType, RetryLimitNotice, build, codec, decode_frame, parse_length_prefix,
};
use bytes::BytesMut;
use chrono::{TimeZone, Utc};
use std::net::SocketAddr;

fn sender() -> SocketAddr {
    "10.1.2.3:20000".parse().unwrap()
}

/// NIST 800-53: SI-10 - Every discriminator maps to exactly one request type
#[test]
fn test_all_request_type_conversions() {
    let all = [
        RequestType::TextMessage,
        RequestType::InboundFileTransferRequest,
        RequestType::OutboundFileTransferRequest,
        RequestType::RequestedFileDoesNotExist,
        RequestType::FileTransferRejected,
        RequestType::FileTransferAccepted,
        RequestType::FileTransferStalled,
        RequestType::FileTransferComplete,
        RequestType::RetryOutboundFileTransfer,
        RequestType::RetryLimitExceeded,
        RequestType::FileListRequest,
        RequestType::FileListResponse,
        RequestType::NoFilesAvailableForDownload,
        RequestType::RequestedFolderDoesNotExist,
        RequestType::ServerInfoRequest,
        RequestType::ServerInfoResponse,
        RequestType::ShutdownServerCommand,
    ];
    for (i, request_type) in all.iter().enumerate() {
        let byte = u8::try_from(i + 1).unwrap();
        assert_eq!(*request_type as u8, byte);
        assert_eq!(RequestType::try_from(byte).unwrap(), *request_type);
    }

    for invalid in [0u8, 18, 100, 255] {
        assert!(matches!(
            RequestType::try_from(invalid),
            Err(Error::UnknownRequestType(b)) if b == invalid
        ));
    }
}

#[test]
fn test_correlated_responses_carry_a_code() {
    for request_type in [
        RequestType::FileTransferRejected,
        RequestType::FileTransferAccepted,
        RequestType::FileTransferStalled,
        RequestType::FileTransferComplete,
        RequestType::RetryOutboundFileTransfer,
    ] {
        assert!(request_type.carries_response_code());
        assert_eq!(request_type.shape(), PayloadShape::Int64);
    }
    assert!(RequestType::RetryLimitExceeded.carries_response_code());
    // Answered with the requester's transfer id, not a response code
    assert!(!RequestType::RequestedFileDoesNotExist.carries_response_code());
    assert_eq!(RequestType::ShutdownServerCommand.shape(), PayloadShape::Empty);
}

/// Integers are big endian on the wire
#[test]
fn test_int64_frame_layout() {
    let frame = build::int64(RequestType::FileTransferComplete, sender(), 0x0102_0304_0506_0708)
        .unwrap();

    let declared = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
    assert_eq!(declared + LENGTH_PREFIX_SIZE, frame.len());
    assert_eq!(frame[4], 8);

    // type, address string, port, value
    let address = b"10.1.2.3";
    let port_at = 5 + 4 + address.len();
    assert_eq!(&frame[9..port_at], address);
    assert_eq!(&frame[port_at..port_at + 2], &20000u16.to_be_bytes());
    assert_eq!(&frame[port_at + 2..], &[1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_inbound_file_transfer_fields() {
    let transfer = InboundFileTransfer {
        response_code: i64::MAX,
        remote_transfer_id: 12,
        retry_counter: 2,
        retry_limit: 3,
        file_path: r"C:\share\photo.jpg".into(),
        file_size: 5_000_000_000,
        remote_folder: "/home/owl/inbox".into(),
    };
    assert_eq!(transfer.file_name(), "photo.jpg");

    let frame = build::inbound_file_transfer_request(sender(), transfer.clone()).unwrap();
    let (request, overflow) = decode_frame(&frame).unwrap();
    assert!(overflow.is_empty());
    assert_eq!(request.payload, Payload::InboundFileTransfer(transfer));
}

#[test]
fn test_retry_limit_notice_keeps_millisecond_precision() {
    let expires = Utc.timestamp_millis_opt(1_900_000_000_123).unwrap();
    let frame = build::retry_limit_exceeded(
        sender(),
        RetryLimitNotice {
            response_code: 5,
            retry_limit: 3,
            lockout_expires: expires,
        },
    )
    .unwrap();

    let (request, _) = decode_frame(&frame).unwrap();
    match request.payload {
        Payload::RetryLimitExceeded(notice) => assert_eq!(notice.lockout_expires, expires),
        other => unreachable!("decoded {:?}", other),
    }
}

#[test]
fn test_ipv6_sender_address() {
    let v6: SocketAddr = "[fd00::7]:31000".parse().unwrap();
    let frame = build::empty(RequestType::ServerInfoRequest, v6).unwrap();
    let (request, _) = decode_frame(&frame).unwrap();
    assert_eq!(request.sender, v6);
}

/// NIST 800-53: SI-10 - Malformed sender addresses are rejected
#[test]
fn test_invalid_sender_address() {
    let mut body = BytesMut::new();
    body.extend_from_slice(&[RequestType::ServerInfoRequest as u8]);
    codec::put_string(&mut body, "not-an-address");
    body.extend_from_slice(&80u16.to_be_bytes());

    assert!(matches!(
        Request::decode_payload(&body),
        Err(Error::Decode {
            field: "sender_address",
            ..
        })
    ));
}

#[test]
fn test_invalid_utf8_string() {
    let mut body = BytesMut::new();
    body.extend_from_slice(&[RequestType::TextMessage as u8]);
    codec::put_string(&mut body, "127.0.0.1");
    body.extend_from_slice(&80u16.to_be_bytes());
    body.extend_from_slice(&2u32.to_be_bytes());
    body.extend_from_slice(&[0xff, 0xfe]);

    assert!(matches!(
        Request::decode_payload(&body),
        Err(Error::Decode { field: "text", .. })
    ));
}

#[test]
fn test_length_prefix_bounds() {
    assert_eq!(parse_length_prefix(1u32.to_be_bytes()).unwrap(), 1);
    assert_eq!(
        parse_length_prefix((MAX_FRAME_SIZE as u32).to_be_bytes()).unwrap(),
        MAX_FRAME_SIZE
    );
    assert!(parse_length_prefix(0u32.to_be_bytes()).is_err());
    assert!(parse_length_prefix((MAX_FRAME_SIZE as u32 + 1).to_be_bytes()).is_err());
}

#[test]
fn test_two_frames_back_to_back() {
    let mut stream = build::string(RequestType::TextMessage, sender(), "first")
        .unwrap()
        .to_vec();
    stream.extend_from_slice(&build::string(RequestType::TextMessage, sender(), "second").unwrap());

    let (first, rest) = decode_frame(&stream).unwrap();
    let (second, rest) = decode_frame(&rest).unwrap();
    assert_eq!(first.payload, Payload::Text("first".into()));
    assert_eq!(second.payload, Payload::Text("second".into()));
    assert!(rest.is_empty());
}

#[test]
fn test_unicode_text_message() {
    let message = "hibou 🦉 ночь";
    let frame = build::string(RequestType::TextMessage, sender(), message).unwrap();
    let (request, _) = decode_frame(&frame).unwrap();
    assert_eq!(request.payload, Payload::Text(message.into()));
}
