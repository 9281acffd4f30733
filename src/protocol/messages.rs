// ABOUTME: Wire message definitions and the binary codec for the stream protocol
// ABOUTME: Fixed 26-byte little-endian header plus typed payloads (binary and JSON)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of the fixed message header in bytes
pub const BASE_MESSAGE_SIZE: usize = 26;

/// Upper bound for a single message payload; anything larger is treated as
/// a corrupt header rather than an allocation request.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

// =============================================================================
// Timestamps
// =============================================================================

/// Wire timestamp: a (seconds, microseconds) pair in the sender's monotonic
/// clock domain. Normalized so that `0 <= usec < 1_000_000`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tv {
    /// Seconds part
    pub sec: i32,
    /// Microseconds part
    pub usec: i32,
}

impl Tv {
    /// Build a normalized timestamp from signed microseconds
    pub fn from_micros(micros: i64) -> Self {
        let mut sec = micros / 1_000_000;
        let mut usec = micros % 1_000_000;
        if usec < 0 {
            sec -= 1;
            usec += 1_000_000;
        }
        Tv {
            sec: sec as i32,
            usec: usec as i32,
        }
    }

    /// Total signed microseconds
    pub fn to_micros(self) -> i64 {
        self.sec as i64 * 1_000_000 + self.usec as i64
    }

    /// Signed difference `self - other` in microseconds
    pub fn diff_micros(self, other: Tv) -> i64 {
        self.to_micros() - other.to_micros()
    }

    fn read(buf: &mut impl Buf) -> Self {
        let sec = buf.get_i32_le();
        let usec = buf.get_i32_le();
        Tv { sec, usec }
    }

    fn write(self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.sec);
        buf.put_i32_le(self.usec);
    }
}

// =============================================================================
// Message header
// =============================================================================

/// Message type discriminator carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Plain base message (never sent on its own)
    Base = 0,
    /// Codec name plus initialization payload
    CodecHeader = 1,
    /// Timestamped audio payload
    WireChunk = 2,
    /// Server -> client settings (JSON)
    ServerSettings = 3,
    /// Time sync request / reply
    Time = 4,
    /// Client -> server greeting (JSON)
    Hello = 5,
    /// Legacy stream metadata; decoded and ignored
    StreamTags = 6,
    /// Client -> server volume / mute state (JSON)
    ClientInfo = 7,
    /// Client -> server system information (JSON)
    ClientSystemInfo = 8,
}

impl MessageType {
    /// Map a raw wire value to a known type
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(MessageType::Base),
            1 => Some(MessageType::CodecHeader),
            2 => Some(MessageType::WireChunk),
            3 => Some(MessageType::ServerSettings),
            4 => Some(MessageType::Time),
            5 => Some(MessageType::Hello),
            6 => Some(MessageType::StreamTags),
            7 => Some(MessageType::ClientInfo),
            8 => Some(MessageType::ClientSystemInfo),
            _ => None,
        }
    }
}

/// Fixed-width header preceding every payload.
///
/// `id` is a per-sender counter; `refers_to` carries the `id` of the message
/// being answered (0 if this is not a reply). `sent` is stamped by the sender
/// immediately before the bytes hit the transport, `received` by the receiver
/// right after the header is parsed. `size` counts payload bytes only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseMessage {
    /// Raw message type value (kept raw so unknown types survive dispatch)
    pub msg_type: u16,
    /// Per-sender monotonically increasing id, wraps at 10_000 for requests
    pub id: u16,
    /// Id of the request this message answers, 0 if none
    pub refers_to: u16,
    /// Sender clock at transmission
    pub sent: Tv,
    /// Receiver clock at reception
    pub received: Tv,
    /// Payload size in bytes
    pub size: u32,
}

impl BaseMessage {
    /// Parse a header from at least [`BASE_MESSAGE_SIZE`] bytes
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < BASE_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "header too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = data;
        let msg_type = buf.get_u16_le();
        let id = buf.get_u16_le();
        let refers_to = buf.get_u16_le();
        let sent = Tv::read(&mut buf);
        let received = Tv::read(&mut buf);
        let size = buf.get_u32_le();
        if size > MAX_PAYLOAD_SIZE {
            return Err(Error::Protocol(format!("implausible payload size {size}")));
        }
        Ok(BaseMessage {
            msg_type,
            id,
            refers_to,
            sent,
            received,
            size,
        })
    }

    /// Serialize the header into `buf`
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.msg_type);
        buf.put_u16_le(self.id);
        buf.put_u16_le(self.refers_to);
        self.sent.write(buf);
        self.received.write(buf);
        buf.put_u32_le(self.size);
    }

    /// The parsed message type, if known
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u16(self.msg_type)
    }
}

// =============================================================================
// String / blob helpers (u32 length prefix, little-endian)
// =============================================================================

fn read_string(buf: &mut Bytes) -> Result<String> {
    let blob = read_blob(buf)?;
    String::from_utf8(blob.to_vec()).map_err(|e| Error::Protocol(e.to_string()))
}

fn read_blob(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(Error::Protocol("truncated length prefix".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(Error::Protocol(format!(
            "truncated field: want {len}, have {}",
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len))
}

fn write_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn write_blob(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32_le(b.len() as u32);
    buf.put_slice(b);
}

// =============================================================================
// Binary payloads
// =============================================================================

/// Codec name plus the codec-specific bytes a decoder needs before any audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecHeader {
    /// Codec name, e.g. "pcm", "flac", "ogg", "opus"
    pub codec: String,
    /// Opaque initialization payload
    pub payload: Bytes,
}

/// Raw audio payload with the recording-start timestamp of its first frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunk {
    /// Recording start in the server clock domain
    pub timestamp: Tv,
    /// Interleaved sample bytes
    pub payload: Bytes,
}

/// Time sync request / reply.
///
/// The client sends an empty latency; the server echoes the message with
/// `refers_to = id` and `latency = received - sent` (its receive stamp minus
/// the client's transmit stamp, a cross-clock difference).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeMsg {
    /// Server receive time minus client send time
    pub latency: Tv,
}

// =============================================================================
// JSON payloads
// =============================================================================

/// Client greeting, first message on every connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    /// MAC address of the client interface ("00:00:00:00:00:00" if unknown)
    #[serde(rename = "MAC")]
    pub mac: String,
    /// Host name of the client machine
    #[serde(rename = "HostName")]
    pub hostname: String,
    /// Client software version
    #[serde(rename = "Version")]
    pub version: String,
    /// Client product name
    #[serde(rename = "ClientName")]
    pub client_name: String,
    /// Operating system
    #[serde(rename = "OS")]
    pub os: String,
    /// CPU architecture
    #[serde(rename = "Arch")]
    pub arch: String,
    /// Instance index for multiple clients on one host, 1-based
    #[serde(rename = "Instance")]
    pub instance: u32,
    /// Stable machine id (falls back to the MAC address)
    #[serde(rename = "ID")]
    pub id: String,
    /// Optional username for authentication
    #[serde(rename = "Username", skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional password for authentication
    #[serde(rename = "Password", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Version of this stream protocol
    #[serde(
        rename = "SnapStreamProtocolVersion",
        default = "default_protocol_version"
    )]
    pub protocol_version: u32,
}

fn default_protocol_version() -> u32 {
    1
}

impl Hello {
    /// Stable unique client id: the machine id, suffixed with `#<instance>`
    /// when more than one instance runs on the same host.
    pub fn unique_id(&self) -> String {
        if self.instance != 1 {
            format!("{}#{}", self.id, self.instance)
        } else {
            self.id.clone()
        }
    }
}

/// Dynamic settings pushed from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSettings {
    /// End-to-end target latency in ms
    #[serde(rename = "bufferMs")]
    pub buffer_ms: i32,
    /// Client-specific additional latency in ms
    pub latency: i32,
    /// Playback volume in percent (0..100)
    pub volume: u16,
    /// Mute state
    pub muted: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            buffer_ms: 0,
            latency: 0,
            volume: 100,
            muted: false,
        }
    }
}

/// Volume / mute state reported from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    /// Current playback volume in percent
    pub volume: u16,
    /// Current mute state
    pub muted: bool,
}

/// Arbitrary system information reported from client to server
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientSystemInfo {
    /// Free-form JSON document
    #[serde(flatten)]
    pub info: serde_json::Map<String, serde_json::Value>,
}

// =============================================================================
// Payload enum and codec
// =============================================================================

/// A fully decoded message payload
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    /// Codec initialization data
    CodecHeader(CodecHeader),
    /// Audio chunk
    WireChunk(WireChunk),
    /// Server settings (JSON)
    ServerSettings(ServerSettings),
    /// Time sync
    Time(TimeMsg),
    /// Client greeting (JSON)
    Hello(Hello),
    /// Client volume / mute (JSON)
    ClientInfo(ClientInfo),
    /// Client system info (JSON)
    ClientSystemInfo(ClientSystemInfo),
    /// Legacy stream tags; carried opaquely so dispatchers can ignore them
    StreamTags(Bytes),
    /// Unknown message type; raw type value and payload are preserved
    Unknown(u16, Bytes),
}

impl MessagePayload {
    /// The wire type value for this payload
    pub fn message_type(&self) -> u16 {
        match self {
            MessagePayload::CodecHeader(_) => MessageType::CodecHeader as u16,
            MessagePayload::WireChunk(_) => MessageType::WireChunk as u16,
            MessagePayload::ServerSettings(_) => MessageType::ServerSettings as u16,
            MessagePayload::Time(_) => MessageType::Time as u16,
            MessagePayload::Hello(_) => MessageType::Hello as u16,
            MessagePayload::ClientInfo(_) => MessageType::ClientInfo as u16,
            MessagePayload::ClientSystemInfo(_) => MessageType::ClientSystemInfo as u16,
            MessagePayload::StreamTags(_) => MessageType::StreamTags as u16,
            MessagePayload::Unknown(t, _) => *t,
        }
    }

    /// True for audio chunks; sessions use this for the age-based drop policy
    pub fn is_chunk(&self) -> bool {
        matches!(self, MessagePayload::WireChunk(_))
    }

    /// Decode a payload according to the header's type.
    ///
    /// `payload` is a view into the receive buffer; chunk payloads keep that
    /// view instead of copying.
    pub fn decode(header: &BaseMessage, mut payload: Bytes) -> Result<MessagePayload> {
        if payload.len() != header.size as usize {
            return Err(Error::Protocol(format!(
                "payload length {} does not match header size {}",
                payload.len(),
                header.size
            )));
        }
        match header.message_type() {
            Some(MessageType::CodecHeader) => {
                let codec = read_string(&mut payload)?;
                let blob = read_blob(&mut payload)?;
                Ok(MessagePayload::CodecHeader(CodecHeader {
                    codec,
                    payload: blob,
                }))
            }
            Some(MessageType::WireChunk) => {
                if payload.remaining() < 8 {
                    return Err(Error::Protocol("truncated chunk timestamp".into()));
                }
                let timestamp = Tv::read(&mut payload);
                let blob = read_blob(&mut payload)?;
                Ok(MessagePayload::WireChunk(WireChunk {
                    timestamp,
                    payload: blob,
                }))
            }
            Some(MessageType::Time) => {
                if payload.remaining() < 8 {
                    return Err(Error::Protocol("truncated time payload".into()));
                }
                let latency = Tv::read(&mut payload);
                Ok(MessagePayload::Time(TimeMsg { latency }))
            }
            Some(MessageType::ServerSettings) => {
                let doc = read_string(&mut payload)?;
                Ok(MessagePayload::ServerSettings(serde_json::from_str(&doc)?))
            }
            Some(MessageType::Hello) => {
                let doc = read_string(&mut payload)?;
                Ok(MessagePayload::Hello(serde_json::from_str(&doc)?))
            }
            Some(MessageType::ClientInfo) => {
                let doc = read_string(&mut payload)?;
                Ok(MessagePayload::ClientInfo(serde_json::from_str(&doc)?))
            }
            Some(MessageType::ClientSystemInfo) => {
                let doc = read_string(&mut payload)?;
                Ok(MessagePayload::ClientSystemInfo(serde_json::from_str(
                    &doc,
                )?))
            }
            Some(MessageType::StreamTags) => Ok(MessagePayload::StreamTags(payload)),
            Some(MessageType::Base) | None => {
                Ok(MessagePayload::Unknown(header.msg_type, payload))
            }
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            MessagePayload::CodecHeader(m) => {
                write_string(buf, &m.codec);
                write_blob(buf, &m.payload);
            }
            MessagePayload::WireChunk(m) => {
                m.timestamp.write(buf);
                write_blob(buf, &m.payload);
            }
            MessagePayload::Time(m) => {
                m.latency.write(buf);
            }
            MessagePayload::ServerSettings(m) => {
                write_string(buf, &serde_json::to_string(m)?);
            }
            MessagePayload::Hello(m) => {
                write_string(buf, &serde_json::to_string(m)?);
            }
            MessagePayload::ClientInfo(m) => {
                write_string(buf, &serde_json::to_string(m)?);
            }
            MessagePayload::ClientSystemInfo(m) => {
                write_string(buf, &serde_json::to_string(m)?);
            }
            MessagePayload::StreamTags(b) => {
                buf.put_slice(b);
            }
            MessagePayload::Unknown(_, b) => {
                buf.put_slice(b);
            }
        }
        Ok(())
    }
}

/// A wire-ready message: header bytes followed by the payload
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// The raw message type
    pub msg_type: u16,
    /// True if the frame carries an audio chunk
    pub is_chunk: bool,
    /// Header + payload bytes, ready for the transport
    pub bytes: Bytes,
}

/// Serialize `payload` with the given header fields.
///
/// `sent` is the sender clock stamp; callers stamp it as close to the
/// transport write as practical.
pub fn serialize(
    payload: &MessagePayload,
    id: u16,
    refers_to: u16,
    sent: Tv,
) -> Result<EncodedFrame> {
    let mut body = BytesMut::new();
    payload.encode_payload(&mut body)?;

    let header = BaseMessage {
        msg_type: payload.message_type(),
        id,
        refers_to,
        sent,
        received: Tv::default(),
        size: body.len() as u32,
    };

    let mut out = BytesMut::with_capacity(BASE_MESSAGE_SIZE + body.len());
    header.write(&mut out);
    out.put_slice(&body);

    Ok(EncodedFrame {
        msg_type: header.msg_type,
        is_chunk: payload.is_chunk(),
        bytes: out.freeze(),
    })
}
