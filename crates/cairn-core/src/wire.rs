//! Cairn wire format: frames exchanged between peer sessions.
//!
//! Every frame is a fixed 8-byte header followed by `length` body bytes:
//!
//! ```text
//! +----------+---------+----------+---------------+----------------+
//! | msg_type | version | reserved | length (LE)   | body ...       |
//! |   u8     |   u8    |   u16    |    u32        | length bytes   |
//! +----------+---------+----------+---------------+----------------+
//! ```
//!
//! Body fields are written in declaration order. Byte strings and strings are
//! `u32 LE length || bytes`, integers are LE u64 (ports LE u16), optionals
//! are a presence byte followed by the value, lists are `u32 LE count ||
//! items`. Changing any of this is a breaking protocol change.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::chunk::ContentKey;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Frame header format version.
pub const FRAME_VERSION: u8 = 0x01;

/// Protocol version announced in STATUS.
pub const PROTOCOL_VERSION: u64 = 0;

/// Capability name announced in STATUS.
pub const CAPABILITY_NAME: &str = "cairn";

/// Largest accepted frame body.
pub const MAX_BODY: usize = 10 * 1024 * 1024;

pub const HEADER_LEN: usize = 8;

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// One of [`MessageType`].
    pub msg_type: u8,
    /// Currently [`FRAME_VERSION`]. Unknown versions are rejected.
    pub version: u8,
    /// Must be zero.
    pub reserved: u16,
    /// Body length, little-endian on the wire.
    pub length: u32,
}

assert_eq_size!(FrameHeader, [u8; HEADER_LEN]);

impl FrameHeader {
    pub fn new(msg_type: MessageType, length: usize) -> Result<Self, WireError> {
        if length > MAX_BODY {
            return Err(WireError::PayloadTooLarge(length));
        }
        Ok(Self {
            msg_type: msg_type as u8,
            version: FRAME_VERSION,
            reserved: 0,
            length: (length as u32).to_le(),
        })
    }

    /// Parse and validate a header. Returns the message type and body length.
    pub fn parse(buf: &[u8]) -> Result<(MessageType, usize), WireError> {
        let header = FrameHeader::read_from_prefix(buf).ok_or(WireError::Truncated)?;
        let version = header.version;
        if version != FRAME_VERSION {
            return Err(WireError::UnknownVersion(version));
        }
        let msg_type = MessageType::try_from(header.msg_type)?;
        let length = u32::from_le(header.length) as usize;
        if length > MAX_BODY {
            return Err(WireError::PayloadTooLarge(length));
        }
        Ok((msg_type, length))
    }
}

// ── Message Types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Status = 0,
    Store = 1,
    Retrieve = 2,
    Peers = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Status),
            1 => Ok(MessageType::Store),
            2 => Ok(MessageType::Retrieve),
            3 => Ok(MessageType::Peers),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// Network address and identity of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub node_id: Bytes,
}

impl PeerAddress {
    pub fn new(ip: Ipv4Addr, port: u16, node_id: impl Into<Bytes>) -> Self {
        Self {
            ip,
            port,
            node_id: node_id.into(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    pub fn short_id(&self) -> String {
        hex::encode(&self.node_id[..self.node_id.len().min(4)])
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.short_id(), self.ip, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub version: u8,
}

/// Handshake announcement. Carries no request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub protocol_version: u64,
    pub client_id: String,
    pub self_address: PeerAddress,
    pub network_id: u64,
    pub capabilities: Vec<Capability>,
}

impl StatusMessage {
    /// A STATUS for this build of the protocol.
    pub fn local(self_address: PeerAddress, network_id: u64) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            client_id: format!("cairn/{}", env!("CARGO_PKG_VERSION")),
            self_address,
            network_id,
            capabilities: vec![Capability {
                name: CAPABILITY_NAME.to_string(),
                version: PROTOCOL_VERSION as u8,
            }],
        }
    }
}

/// Carries a chunk, either unsolicited or in answer to a retrieve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    pub key: ContentKey,
    pub data: Bytes,
    pub request_id: Option<u64>,
    pub metadata: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveRequest {
    pub key: ContentKey,
    pub request_id: Option<u64>,
    pub max_size: Option<u64>,
    pub max_peers: Option<u64>,
    pub timeout: Option<u64>,
}

impl RetrieveRequest {
    pub fn new(key: ContentKey) -> Self {
        Self {
            key,
            request_id: None,
            max_size: None,
            max_peers: None,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeersMessage {
    pub peers: Vec<PeerAddress>,
    pub key: Option<ContentKey>,
    pub request_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Status(StatusMessage),
    Store(StoreRequest),
    Retrieve(RetrieveRequest),
    Peers(PeersMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Status(_) => MessageType::Status,
            Message::Store(_) => MessageType::Store,
            Message::Retrieve(_) => MessageType::Retrieve,
            Message::Peers(_) => MessageType::Peers,
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        match self {
            Message::Status(_) => None,
            Message::Store(m) => m.request_id,
            Message::Retrieve(m) => m.request_id,
            Message::Peers(m) => m.request_id,
        }
    }

    /// Stamp a request id. No-op for STATUS.
    pub fn set_request_id(&mut self, id: u64) {
        match self {
            Message::Status(_) => {}
            Message::Store(m) => m.request_id = Some(id),
            Message::Retrieve(m) => m.request_id = Some(id),
            Message::Peers(m) => m.request_id = Some(id),
        }
    }

    /// Encode header and body into one frame.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut body = BytesMut::new();
        match self {
            Message::Status(m) => {
                body.put_u64_le(m.protocol_version);
                put_bytes(&mut body, m.client_id.as_bytes());
                put_peer(&mut body, &m.self_address);
                body.put_u64_le(m.network_id);
                body.put_u32_le(m.capabilities.len() as u32);
                for cap in &m.capabilities {
                    put_bytes(&mut body, cap.name.as_bytes());
                    body.put_u8(cap.version);
                }
            }
            Message::Store(m) => {
                put_bytes(&mut body, m.key.as_bytes());
                put_bytes(&mut body, &m.data);
                put_opt_u64(&mut body, m.request_id);
                match &m.metadata {
                    Some(meta) => {
                        body.put_u8(1);
                        put_bytes(&mut body, meta);
                    }
                    None => body.put_u8(0),
                }
            }
            Message::Retrieve(m) => {
                put_bytes(&mut body, m.key.as_bytes());
                put_opt_u64(&mut body, m.request_id);
                put_opt_u64(&mut body, m.max_size);
                put_opt_u64(&mut body, m.max_peers);
                put_opt_u64(&mut body, m.timeout);
            }
            Message::Peers(m) => {
                body.put_u32_le(m.peers.len() as u32);
                for peer in &m.peers {
                    put_peer(&mut body, peer);
                }
                match &m.key {
                    Some(key) => {
                        body.put_u8(1);
                        put_bytes(&mut body, key.as_bytes());
                    }
                    None => body.put_u8(0),
                }
                put_opt_u64(&mut body, m.request_id);
            }
        }

        let header = FrameHeader::new(self.message_type(), body.len())?;
        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
        frame.put_slice(header.as_bytes());
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Decode a complete frame. Trailing bytes are an error.
    pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
        let (msg_type, length) = FrameHeader::parse(frame)?;
        let body = &frame[HEADER_LEN..];
        if body.len() < length {
            return Err(WireError::Truncated);
        }
        if body.len() > length {
            return Err(WireError::Malformed("trailing bytes after body"));
        }
        Self::decode_body(msg_type, body)
    }

    /// Decode a body whose header has already been parsed.
    pub fn decode_body(msg_type: MessageType, body: &[u8]) -> Result<Message, WireError> {
        let mut buf = body;
        let msg = match msg_type {
            MessageType::Status => {
                let protocol_version = get_u64(&mut buf)?;
                let client_id = get_string(&mut buf)?;
                let self_address = get_peer(&mut buf)?;
                let network_id = get_u64(&mut buf)?;
                let count = get_count(&mut buf)?;
                let mut capabilities = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let name = get_string(&mut buf)?;
                    let version = get_u8(&mut buf)?;
                    capabilities.push(Capability { name, version });
                }
                Message::Status(StatusMessage {
                    protocol_version,
                    client_id,
                    self_address,
                    network_id,
                    capabilities,
                })
            }
            MessageType::Store => {
                let key = ContentKey::new(get_bytes(&mut buf)?);
                let data = get_bytes(&mut buf)?;
                let request_id = get_opt_u64(&mut buf)?;
                let metadata = if get_presence(&mut buf)? {
                    Some(get_bytes(&mut buf)?)
                } else {
                    None
                };
                Message::Store(StoreRequest {
                    key,
                    data,
                    request_id,
                    metadata,
                })
            }
            MessageType::Retrieve => Message::Retrieve(RetrieveRequest {
                key: ContentKey::new(get_bytes(&mut buf)?),
                request_id: get_opt_u64(&mut buf)?,
                max_size: get_opt_u64(&mut buf)?,
                max_peers: get_opt_u64(&mut buf)?,
                timeout: get_opt_u64(&mut buf)?,
            }),
            MessageType::Peers => {
                let count = get_count(&mut buf)?;
                let mut peers = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    peers.push(get_peer(&mut buf)?);
                }
                let key = if get_presence(&mut buf)? {
                    Some(ContentKey::new(get_bytes(&mut buf)?))
                } else {
                    None
                };
                let request_id = get_opt_u64(&mut buf)?;
                Message::Peers(PeersMessage {
                    peers,
                    key,
                    request_id,
                })
            }
        };
        if buf.has_remaining() {
            return Err(WireError::Malformed("trailing bytes after body"));
        }
        Ok(msg)
    }
}

// ── Field codecs ──────────────────────────────────────────────────────────────

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn put_opt_u64(buf: &mut BytesMut, v: Option<u64>) {
    match v {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64_le(v);
        }
        None => buf.put_u8(0),
    }
}

fn put_peer(buf: &mut BytesMut, peer: &PeerAddress) {
    buf.put_slice(&peer.ip.octets());
    buf.put_u16_le(peer.port);
    put_bytes(buf, &peer.node_id);
}

fn need(buf: &&[u8], n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::Truncated)
    } else {
        Ok(())
    }
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, WireError> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn get_count(buf: &mut &[u8]) -> Result<usize, WireError> {
    need(buf, 4)?;
    Ok(buf.get_u32_le() as usize)
}

fn get_bytes(buf: &mut &[u8]) -> Result<Bytes, WireError> {
    let len = get_count(buf)?;
    need(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

fn get_string(buf: &mut &[u8]) -> Result<String, WireError> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::Malformed("string is not utf-8"))
}

fn get_presence(buf: &mut &[u8]) -> Result<bool, WireError> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(WireError::Malformed("presence byte must be 0 or 1")),
    }
}

fn get_opt_u64(buf: &mut &[u8]) -> Result<Option<u64>, WireError> {
    if get_presence(buf)? {
        Ok(Some(get_u64(buf)?))
    } else {
        Ok(None)
    }
}

fn get_peer(buf: &mut &[u8]) -> Result<PeerAddress, WireError> {
    need(buf, 6)?;
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    let port = buf.get_u16_le();
    let node_id = get_bytes(buf)?;
    Ok(PeerAddress {
        ip: Ipv4Addr::from(octets),
        port,
        node_id,
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("body length {0} exceeds maximum {}", MAX_BODY)]
    PayloadTooLarge(usize),

    #[error("frame truncated")]
    Truncated,

    #[error("malformed body: {0}")]
    Malformed(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(last: u8) -> PeerAddress {
        PeerAddress::new(Ipv4Addr::new(10, 0, 0, last), 30399, vec![last; 32])
    }

    fn store(data: &'static [u8]) -> Message {
        Message::Store(StoreRequest {
            key: ContentKey::from_slice(&[0xaa; 32]),
            data: Bytes::from_static(data),
            request_id: Some(7),
            metadata: None,
        })
    }

    #[test]
    fn header_layout() {
        let header = FrameHeader::new(MessageType::Retrieve, 0x0102).unwrap();
        let bytes = header.as_bytes();
        assert_eq!(bytes, &[2, FRAME_VERSION, 0, 0, 0x02, 0x01, 0, 0]);
    }

    #[test]
    fn status_round_trip() {
        let msg = Message::Status(StatusMessage::local(peer(1), 42));
        let frame = msg.encode().unwrap();
        assert_eq!(frame[0], 0);
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn store_body_layout() {
        let frame = store(b"xy").encode().unwrap();
        let body = &frame[HEADER_LEN..];
        assert_eq!(&body[..4], &32u32.to_le_bytes());
        assert_eq!(&body[36..40], &2u32.to_le_bytes());
        assert_eq!(&body[40..42], b"xy");
        assert_eq!(body[42], 1);
        assert_eq!(&body[43..51], &7u64.to_le_bytes());
        assert_eq!(body[51], 0);
        assert_eq!(body.len(), 52);
    }

    #[test]
    fn peers_and_retrieve_decode() {
        let peers = Message::Peers(PeersMessage {
            peers: vec![peer(1), peer(2)],
            key: Some(ContentKey::zero()),
            request_id: None,
        });
        assert_eq!(Message::decode(&peers.encode().unwrap()).unwrap(), peers);

        let mut retrieve = Message::Retrieve(RetrieveRequest::new(ContentKey::from_slice(b"k")));
        assert_eq!(retrieve.request_id(), None);
        retrieve.set_request_id(99);
        assert_eq!(retrieve.request_id(), Some(99));
        assert_eq!(Message::decode(&retrieve.encode().unwrap()).unwrap(), retrieve);
    }

    #[test]
    fn status_ignores_request_id() {
        let mut msg = Message::Status(StatusMessage::local(peer(1), 1));
        msg.set_request_id(5);
        assert_eq!(msg.request_id(), None);
    }

    #[test]
    fn unknown_type_rejected() {
        let mut frame = store(b"a").encode().unwrap().to_vec();
        frame[0] = 9;
        assert_eq!(Message::decode(&frame), Err(WireError::UnknownMessageType(9)));
    }

    #[test]
    fn unknown_version_rejected() {
        let mut frame = store(b"a").encode().unwrap().to_vec();
        frame[1] = 0x7f;
        assert_eq!(Message::decode(&frame), Err(WireError::UnknownVersion(0x7f)));
    }

    #[test]
    fn truncated_body_rejected() {
        let frame = store(b"abc").encode().unwrap();
        assert_eq!(
            Message::decode(&frame[..frame.len() - 1]),
            Err(WireError::Truncated)
        );
        assert_eq!(Message::decode(&frame[..4]), Err(WireError::Truncated));
    }

    #[test]
    fn lying_inner_length_is_truncated() {
        let mut frame = store(b"abc").encode().unwrap().to_vec();
        // Inflate the data length prefix beyond the body.
        frame[HEADER_LEN + 36..HEADER_LEN + 40].copy_from_slice(&1000u32.to_le_bytes());
        assert_eq!(Message::decode(&frame), Err(WireError::Truncated));
    }

    #[test]
    fn oversized_header_rejected() {
        let mut frame = vec![1u8, FRAME_VERSION, 0, 0];
        frame.extend_from_slice(&((MAX_BODY + 1) as u32).to_le_bytes());
        assert_eq!(
            FrameHeader::parse(&frame),
            Err(WireError::PayloadTooLarge(MAX_BODY + 1))
        );
    }

    #[test]
    fn bad_presence_byte_rejected() {
        let mut frame = store(b"a").encode().unwrap().to_vec();
        let last = frame.len() - 1;
        frame[last] = 2;
        assert!(matches!(Message::decode(&frame), Err(WireError::Malformed(_))));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let frame = store(b"a").encode().unwrap();
        let (ty, len) = FrameHeader::parse(&frame).unwrap();
        let mut body = frame[HEADER_LEN..HEADER_LEN + len].to_vec();
        body.push(0);
        assert!(matches!(
            Message::decode_body(ty, &body),
            Err(WireError::Malformed(_))
        ));
    }
}
