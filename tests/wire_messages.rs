// ABOUTME: Wire codec round-trip and framing tests
// ABOUTME: Covers every message variant, truncation handling and the JSON field names

use bytes::Bytes;
use snapstream::protocol::messages::{
    serialize, BaseMessage, ClientInfo, ClientSystemInfo, CodecHeader, Hello, MessagePayload,
    ServerSettings, TimeMsg, Tv, WireChunk, BASE_MESSAGE_SIZE,
};

fn hello() -> Hello {
    Hello {
        mac: "00:11:22:33:44:55".into(),
        hostname: "living-room".into(),
        version: "0.28.0".into(),
        client_name: "Snapstream".into(),
        os: "linux".into(),
        arch: "x86_64".into(),
        instance: 1,
        id: "00:11:22:33:44:55".into(),
        username: None,
        password: None,
        protocol_version: 2,
    }
}

fn round_trip(payload: MessagePayload) -> (BaseMessage, MessagePayload) {
    let frame = serialize(&payload, 7, 3, Tv::from_micros(1_234_567)).unwrap();
    let header = BaseMessage::read(&frame.bytes).unwrap();
    let body = frame.bytes.slice(BASE_MESSAGE_SIZE..);
    let decoded = MessagePayload::decode(&header, body).unwrap();
    (header, decoded)
}

// =============================================================================
// Header
// =============================================================================

#[test]
fn test_header_layout_is_26_bytes_little_endian() {
    let frame = serialize(
        &MessagePayload::Time(TimeMsg::default()),
        0x0102,
        0x0304,
        Tv { sec: 1, usec: 2 },
    )
    .unwrap();

    // type=4 (Time), id, refers_to, sent, zero received, size=8.
    assert_eq!(&frame.bytes[0..2], &[4, 0]);
    assert_eq!(&frame.bytes[2..4], &[0x02, 0x01]);
    assert_eq!(&frame.bytes[4..6], &[0x04, 0x03]);
    assert_eq!(&frame.bytes[6..10], &1i32.to_le_bytes());
    assert_eq!(&frame.bytes[10..14], &2i32.to_le_bytes());
    assert_eq!(&frame.bytes[22..26], &8u32.to_le_bytes());
    assert_eq!(frame.bytes.len(), BASE_MESSAGE_SIZE + 8);
}

#[test]
fn test_header_round_trip_preserves_fields() {
    let (header, _) = round_trip(MessagePayload::Time(TimeMsg {
        latency: Tv::from_micros(250),
    }));
    assert_eq!(header.id, 7);
    assert_eq!(header.refers_to, 3);
    assert_eq!(header.sent.to_micros(), 1_234_567);
    assert_eq!(header.size, 8);
}

#[test]
fn test_truncated_header_is_rejected() {
    assert!(BaseMessage::read(&[0u8; 10]).is_err());
}

#[test]
fn test_short_payload_is_rejected() {
    let frame = serialize(
        &MessagePayload::CodecHeader(CodecHeader {
            codec: "pcm".into(),
            payload: Bytes::from_static(&[1, 2, 3, 4]),
        }),
        1,
        0,
        Tv::default(),
    )
    .unwrap();
    let header = BaseMessage::read(&frame.bytes).unwrap();
    // Drop the last byte of the payload.
    let body = frame.bytes.slice(BASE_MESSAGE_SIZE..frame.bytes.len() - 1);
    assert!(MessagePayload::decode(&header, body).is_err());
}

#[test]
fn test_implausible_size_is_rejected() {
    let mut bytes = vec![0u8; BASE_MESSAGE_SIZE];
    bytes[22..26].copy_from_slice(&u32::MAX.to_le_bytes());
    assert!(BaseMessage::read(&bytes).is_err());
}

#[test]
fn test_unknown_type_is_preserved_for_the_dispatcher() {
    let mut bytes = vec![0u8; BASE_MESSAGE_SIZE];
    bytes[0..2].copy_from_slice(&99u16.to_le_bytes());
    let header = BaseMessage::read(&bytes).unwrap();
    let decoded = MessagePayload::decode(&header, Bytes::new()).unwrap();
    assert!(matches!(decoded, MessagePayload::Unknown(99, _)));
}

// =============================================================================
// Timestamps
// =============================================================================

#[test]
fn test_tv_normalizes_negative_micros() {
    let tv = Tv::from_micros(-1_500_000);
    assert_eq!(tv.sec, -2);
    assert_eq!(tv.usec, 500_000);
    assert_eq!(tv.to_micros(), -1_500_000);
}

#[test]
fn test_tv_difference_is_signed() {
    let a = Tv::from_micros(5_000_000);
    let b = Tv::from_micros(5_000_700);
    assert_eq!(b.diff_micros(a), 700);
    assert_eq!(a.diff_micros(b), -700);
}

// =============================================================================
// Payload round trips
// =============================================================================

#[test]
fn test_codec_header_round_trip() {
    let payload = MessagePayload::CodecHeader(CodecHeader {
        codec: "flac".into(),
        payload: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
    });
    let (_, decoded) = round_trip(payload.clone());
    assert_eq!(decoded, payload);
}

#[test]
fn test_wire_chunk_round_trip() {
    let payload = MessagePayload::WireChunk(WireChunk {
        timestamp: Tv::from_micros(42_000_017),
        payload: Bytes::from(vec![7u8; 3840]),
    });
    let (_, decoded) = round_trip(payload.clone());
    assert_eq!(decoded, payload);
}

#[test]
fn test_time_round_trip() {
    let payload = MessagePayload::Time(TimeMsg {
        latency: Tv::from_micros(-123),
    });
    let (_, decoded) = round_trip(payload.clone());
    assert_eq!(decoded, payload);
}

#[test]
fn test_hello_round_trip_and_json_field_names() {
    let payload = MessagePayload::Hello(hello());
    let frame = serialize(&payload, 1, 0, Tv::default()).unwrap();
    let json = std::str::from_utf8(&frame.bytes[BASE_MESSAGE_SIZE + 4..]).unwrap();
    assert!(json.contains("\"MAC\":\"00:11:22:33:44:55\""));
    assert!(json.contains("\"HostName\":\"living-room\""));
    assert!(json.contains("\"SnapStreamProtocolVersion\":2"));
    assert!(!json.contains("Username"), "absent options stay absent");

    let (_, decoded) = round_trip(payload.clone());
    assert_eq!(decoded, payload);
}

#[test]
fn test_server_settings_round_trip_uses_camel_case() {
    let payload = MessagePayload::ServerSettings(ServerSettings {
        buffer_ms: 1000,
        latency: 20,
        volume: 80,
        muted: true,
    });
    let frame = serialize(&payload, 1, 0, Tv::default()).unwrap();
    let json = std::str::from_utf8(&frame.bytes[BASE_MESSAGE_SIZE + 4..]).unwrap();
    assert!(json.contains("\"bufferMs\":1000"));

    let (_, decoded) = round_trip(payload.clone());
    assert_eq!(decoded, payload);
}

#[test]
fn test_client_info_round_trip() {
    let payload = MessagePayload::ClientInfo(ClientInfo {
        volume: 55,
        muted: false,
    });
    let (_, decoded) = round_trip(payload.clone());
    assert_eq!(decoded, payload);
}

#[test]
fn test_client_system_info_keeps_arbitrary_fields() {
    let mut info = ClientSystemInfo::default();
    info.info
        .insert("uptime".into(), serde_json::Value::from(12345));
    let payload = MessagePayload::ClientSystemInfo(info);
    let (_, decoded) = round_trip(payload.clone());
    assert_eq!(decoded, payload);
}

// =============================================================================
// Hello identity
// =============================================================================

#[test]
fn test_unique_id_is_plain_for_first_instance() {
    let h = hello();
    assert_eq!(h.unique_id(), "00:11:22:33:44:55");
}

#[test]
fn test_unique_id_gets_instance_suffix() {
    let mut h = hello();
    h.instance = 2;
    assert_eq!(h.unique_id(), "00:11:22:33:44:55#2");
}
