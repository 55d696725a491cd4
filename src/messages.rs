//! # Wire Protocol Messages
//!
//! This module defines the datagram format spoken between nodes: a 4-byte
//! header followed by a sequence of TLVs (type-length-value fields).
//!
//! ## Frame Layout
//!
//! ```text
//! Header: magic(1) version(1) body_length(2, big-endian)
//! Body:   TLV*   where TLV = type(1) length(1) value(length)
//!                PAD1 is type(1) only
//! ```
//!
//! ## TLV Types
//!
//! | Type | Name | Body |
//! |------|------|------|
//! | 0 | `Pad1` | none |
//! | 1 | `PadN` | `len` zero bytes |
//! | 2 | `Hello` | source_id(8) [+ dest_id(8)] |
//! | 3 | `Neighbour` | ip(16) + port(2) |
//! | 4 | `Data` | origin_id(8) + nonce(4) + type(1) + payload |
//! | 5 | `Ack` | origin_id(8) + nonce(4) |
//! | 6 | `GoAway` | code(1) + message |
//! | 7 | `Warning` | message |
//!
//! ## Decoding Rules
//!
//! - A frame whose header is wrong (short, magic, version, length) is rejected.
//! - An unknown TLV type, a TLV running past the frame, or a TLV whose length
//!   does not fit its type rejects the whole frame. Nothing is partially applied.
//!
//! ## Limits
//!
//! - `MAX_TLV_BODY`: 255 bytes (one length byte)
//! - `MAX_DATA_PAYLOAD`: 242 bytes of user data per DATA TLV
//! - `MAX_DATAGRAM_SIZE`: outbound datagrams fit the IPv6 minimum MTU

use std::fmt;
use std::net::Ipv6Addr;

use crate::identity::{NeighbourAddr, NodeId};

/// First header byte of every datagram.
pub const MAGIC: u8 = 93;

/// Protocol version spoken by this implementation.
pub const VERSION: u8 = 2;

/// magic(1) + version(1) + body_length(2).
pub const HEADER_SIZE: usize = 4;

/// A TLV body length is a single byte.
pub const MAX_TLV_BODY: usize = u8::MAX as usize;

/// origin_id(8) + nonce(4) + payload_type(1).
pub const DATA_HEADER_SIZE: usize = 13;

/// Largest payload carried by one DATA TLV.
pub const MAX_DATA_PAYLOAD: usize = MAX_TLV_BODY - DATA_HEADER_SIZE;

/// Largest message carried by one GO_AWAY TLV (after the code byte).
pub const MAX_GO_AWAY_MESSAGE: usize = MAX_TLV_BODY - 1;

/// Outbound datagram budget: 1280 (IPv6 minimum MTU) - 40 (IPv6) - 8 (UDP).
pub const MAX_DATAGRAM_SIZE: usize = 1232;

/// Receive buffer size. Larger datagrams are truncated by the OS and then fail
/// the body-length check.
pub const MAX_RECEIVE_SIZE: usize = 4096;

/// Payload type for plain text chat lines.
pub const PAYLOAD_TYPE_TEXT: u8 = 0;

const HELLO_SHORT_LEN: usize = 8;
const HELLO_LONG_LEN: usize = 16;
const NEIGHBOUR_LEN: usize = 18;
const ACK_LEN: usize = 12;

/// Identity of a data item: who authored it and which of their items it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataKey {
    pub origin: NodeId,
    pub nonce: u32,
}

impl DataKey {
    pub const fn new(origin: NodeId, nonce: u32) -> Self {
        Self { origin, nonce }
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.nonce)
    }
}

/// TLV type byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvType {
    Pad1 = 0,
    PadN = 1,
    Hello = 2,
    Neighbour = 3,
    Data = 4,
    Ack = 5,
    GoAway = 6,
    Warning = 7,
}

impl TlvType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Pad1,
            1 => Self::PadN,
            2 => Self::Hello,
            3 => Self::Neighbour,
            4 => Self::Data,
            5 => Self::Ack,
            6 => Self::GoAway,
            7 => Self::Warning,
            _ => return None,
        })
    }
}

impl fmt::Display for TlvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pad1 => "PAD1",
            Self::PadN => "PADN",
            Self::Hello => "HELLO",
            Self::Neighbour => "NEIGHBOUR",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::GoAway => "GO_AWAY",
            Self::Warning => "WARNING",
        };
        f.write_str(name)
    }
}

/// Reason code carried by a GO_AWAY TLV.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GoAwayCode {
    Unknown,
    /// The sender is shutting down.
    Leaving,
    /// The receiver did not acknowledge data in time.
    Inactive,
    /// The receiver sent a malformed datagram.
    ProtocolViolation,
    Other(u8),
}

impl GoAwayCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => Self::Unknown,
            1 => Self::Leaving,
            2 => Self::Inactive,
            3 => Self::ProtocolViolation,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Leaving => 1,
            Self::Inactive => 2,
            Self::ProtocolViolation => 3,
            Self::Other(code) => code,
        }
    }
}

/// One protocol field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tlv {
    Pad1,
    PadN(u8),
    /// Short hello when `destination` is `None`, long hello otherwise.
    Hello {
        source: NodeId,
        destination: Option<NodeId>,
    },
    Neighbour(NeighbourAddr),
    Data {
        key: DataKey,
        payload_type: u8,
        payload: Vec<u8>,
    },
    Ack(DataKey),
    GoAway {
        code: GoAwayCode,
        message: Vec<u8>,
    },
    Warning(Vec<u8>),
}

impl Tlv {
    pub fn short_hello(source: NodeId) -> Self {
        Self::Hello { source, destination: None }
    }

    pub fn long_hello(source: NodeId, destination: NodeId) -> Self {
        Self::Hello { source, destination: Some(destination) }
    }

    /// GO_AWAY with a text reason, truncated to fit the TLV.
    pub fn go_away(code: GoAwayCode, reason: &str) -> Self {
        let mut message = reason.as_bytes().to_vec();
        message.truncate(MAX_GO_AWAY_MESSAGE);
        Self::GoAway { code, message }
    }

    /// WARNING with a text body, truncated to fit the TLV.
    pub fn warning(text: &str) -> Self {
        let mut message = text.as_bytes().to_vec();
        message.truncate(MAX_TLV_BODY);
        Self::Warning(message)
    }

    pub fn tlv_type(&self) -> TlvType {
        match self {
            Self::Pad1 => TlvType::Pad1,
            Self::PadN(_) => TlvType::PadN,
            Self::Hello { .. } => TlvType::Hello,
            Self::Neighbour(_) => TlvType::Neighbour,
            Self::Data { .. } => TlvType::Data,
            Self::Ack(_) => TlvType::Ack,
            Self::GoAway { .. } => TlvType::GoAway,
            Self::Warning(_) => TlvType::Warning,
        }
    }

    /// Length of the value part.
    pub fn body_len(&self) -> usize {
        match self {
            Self::Pad1 => 0,
            Self::PadN(len) => *len as usize,
            Self::Hello { destination: None, .. } => HELLO_SHORT_LEN,
            Self::Hello { destination: Some(_), .. } => HELLO_LONG_LEN,
            Self::Neighbour(_) => NEIGHBOUR_LEN,
            Self::Data { payload, .. } => DATA_HEADER_SIZE + payload.len(),
            Self::Ack(_) => ACK_LEN,
            Self::GoAway { message, .. } => 1 + message.len(),
            Self::Warning(message) => message.len(),
        }
    }

    /// Bytes this TLV occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Self::Pad1 => 1,
            other => 2 + other.body_len(),
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.tlv_type() as u8);
        if matches!(self, Self::Pad1) {
            return;
        }
        // Length validated by Message::push.
        buf.push(self.body_len() as u8);

        match self {
            Self::Pad1 => {}
            Self::PadN(len) => buf.resize(buf.len() + *len as usize, 0),
            Self::Hello { source, destination } => {
                buf.extend_from_slice(&source.to_be_bytes());
                if let Some(dest) = destination {
                    buf.extend_from_slice(&dest.to_be_bytes());
                }
            }
            Self::Neighbour(addr) => {
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Self::Data { key, payload_type, payload } => {
                buf.extend_from_slice(&key.origin.to_be_bytes());
                buf.extend_from_slice(&key.nonce.to_be_bytes());
                buf.push(*payload_type);
                buf.extend_from_slice(payload);
            }
            Self::Ack(key) => {
                buf.extend_from_slice(&key.origin.to_be_bytes());
                buf.extend_from_slice(&key.nonce.to_be_bytes());
            }
            Self::GoAway { code, message } => {
                buf.push(code.as_u8());
                buf.extend_from_slice(message);
            }
            Self::Warning(message) => buf.extend_from_slice(message),
        }
    }

    fn decode_body(tlv_type: TlvType, body: &[u8]) -> Result<Self, DecodeError> {
        let bad_length = || DecodeError::BadTlvLength { tlv_type, len: body.len() };

        match tlv_type {
            TlvType::Pad1 => Ok(Self::Pad1),
            TlvType::PadN => Ok(Self::PadN(body.len() as u8)),
            TlvType::Hello => match body.len() {
                HELLO_SHORT_LEN => Ok(Self::short_hello(read_id(&body[0..8]))),
                HELLO_LONG_LEN => Ok(Self::long_hello(read_id(&body[0..8]), read_id(&body[8..16]))),
                _ => Err(bad_length()),
            },
            TlvType::Neighbour => {
                if body.len() != NEIGHBOUR_LEN {
                    return Err(bad_length());
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[0..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                Ok(Self::Neighbour(NeighbourAddr::new(Ipv6Addr::from(octets), port)))
            }
            TlvType::Data => {
                if body.len() < DATA_HEADER_SIZE {
                    return Err(bad_length());
                }
                Ok(Self::Data {
                    key: read_key(&body[0..12]),
                    payload_type: body[12],
                    payload: body[DATA_HEADER_SIZE..].to_vec(),
                })
            }
            TlvType::Ack => {
                if body.len() != ACK_LEN {
                    return Err(bad_length());
                }
                Ok(Self::Ack(read_key(body)))
            }
            TlvType::GoAway => {
                let (&code, message) = body.split_first().ok_or_else(bad_length)?;
                Ok(Self::GoAway {
                    code: GoAwayCode::from_u8(code),
                    message: message.to_vec(),
                })
            }
            TlvType::Warning => Ok(Self::Warning(body.to_vec())),
        }
    }
}

fn read_id(bytes: &[u8]) -> NodeId {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    NodeId::from_be_bytes(buf)
}

fn read_key(bytes: &[u8]) -> DataKey {
    let nonce = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    DataKey::new(read_id(bytes), nonce)
}

/// A datagram: header plus ordered TLVs.
///
/// `body_length` always equals the sum of the TLVs' wire lengths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    tlvs: Vec<Tlv>,
    body_length: u16,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message holding exactly one TLV.
    pub fn single(tlv: Tlv) -> Result<Self, EncodeError> {
        let mut message = Self::new();
        message.push(tlv)?;
        Ok(message)
    }

    /// Append a TLV, rejecting bodies that do not fit the length byte.
    pub fn push(&mut self, tlv: Tlv) -> Result<(), EncodeError> {
        let body_len = tlv.body_len();
        if body_len > MAX_TLV_BODY {
            return Err(EncodeError::BodyTooLong { tlv_type: tlv.tlv_type(), len: body_len });
        }
        let total = self.body_length as usize + tlv.wire_len();
        let body_length = u16::try_from(total).map_err(|_| EncodeError::MessageTooLong { len: total })?;

        self.body_length = body_length;
        self.tlvs.push(tlv);
        Ok(())
    }

    /// Whether `tlv` can be appended without the datagram exceeding `limit` bytes.
    pub fn fits(&self, tlv: &Tlv, limit: usize) -> bool {
        self.encoded_len() + tlv.wire_len() <= limit
    }

    pub fn tlvs(&self) -> &[Tlv] {
        &self.tlvs
    }

    pub fn body_length(&self) -> u16 {
        self.body_length
    }

    pub fn is_empty(&self) -> bool {
        self.tlvs.is_empty()
    }

    /// Size of the encoded datagram.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.body_length as usize
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(MAGIC);
        buf.push(VERSION);
        buf.extend_from_slice(&self.body_length.to_be_bytes());
        for tlv in &self.tlvs {
            tlv.encode_into(&mut buf);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::TooShort { len: bytes.len() });
        }
        if bytes[0] != MAGIC {
            return Err(DecodeError::BadMagic(bytes[0]));
        }
        if bytes[1] != VERSION {
            return Err(DecodeError::BadVersion(bytes[1]));
        }
        let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let body = &bytes[HEADER_SIZE..];
        if declared != body.len() {
            return Err(DecodeError::LengthMismatch { declared, actual: body.len() });
        }

        let mut message = Self::new();
        let mut pos = 0;
        while pos < body.len() {
            let type_byte = body[pos];
            let tlv_type = TlvType::from_u8(type_byte).ok_or(DecodeError::UnknownTlv(type_byte))?;

            if tlv_type == TlvType::Pad1 {
                message.tlvs.push(Tlv::Pad1);
                pos += 1;
                continue;
            }

            let len = *body.get(pos + 1).ok_or(DecodeError::Truncated { tlv_type })? as usize;
            let start = pos + 2;
            let end = start + len;
            let value = body.get(start..end).ok_or(DecodeError::Truncated { tlv_type })?;
            message.tlvs.push(Tlv::decode_body(tlv_type, value)?);
            pos = end;
        }
        // declared fits in u16 and equals the walked length.
        message.body_length = declared as u16;
        Ok(message)
    }
}

/// Why an inbound datagram was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Shorter than the 4-byte header.
    TooShort { len: usize },
    BadMagic(u8),
    BadVersion(u8),
    /// Header body length disagrees with the bytes that follow it.
    LengthMismatch { declared: usize, actual: usize },
    UnknownTlv(u8),
    /// A TLV header or value runs past the end of the datagram.
    Truncated { tlv_type: TlvType },
    /// A TLV value length that is impossible for its type.
    BadTlvLength { tlv_type: TlvType, len: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "datagram too short ({} bytes)", len),
            Self::BadMagic(magic) => write!(f, "bad magic {} (expected {})", magic, MAGIC),
            Self::BadVersion(version) => write!(f, "unsupported version {} (expected {})", version, VERSION),
            Self::LengthMismatch { declared, actual } => {
                write!(f, "body length {} does not match {} trailing bytes", declared, actual)
            }
            Self::UnknownTlv(ty) => write!(f, "unknown TLV type {}", ty),
            Self::Truncated { tlv_type } => write!(f, "{} TLV runs past end of datagram", tlv_type),
            Self::BadTlvLength { tlv_type, len } => write!(f, "invalid {} TLV length {}", tlv_type, len),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Why an outbound TLV could not be added to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    BodyTooLong { tlv_type: TlvType, len: usize },
    MessageTooLong { len: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BodyTooLong { tlv_type, len } => {
                write!(f, "{} TLV body of {} bytes exceeds {}", tlv_type, len, MAX_TLV_BODY)
            }
            Self::MessageTooLong { len } => write!(f, "message body of {} bytes exceeds {}", len, u16::MAX),
        }
    }
}

impl std::error::Error for EncodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(origin: u64, nonce: u32) -> DataKey {
        DataKey::new(NodeId::from_u64(origin), nonce)
    }

    fn round_trip(tlv: Tlv) {
        let message = Message::single(tlv.clone()).expect("tlv fits");
        let bytes = message.encode();
        assert_eq!(bytes.len(), message.encoded_len());
        let decoded = Message::decode(&bytes).expect("decodes");
        assert_eq!(decoded.tlvs(), &[tlv]);
        assert_eq!(decoded.body_length(), message.body_length());
    }

    #[test]
    fn every_tlv_type_round_trips() {
        let addr = NeighbourAddr::new("2001:db8::7".parse().unwrap(), 1212);

        round_trip(Tlv::Pad1);
        round_trip(Tlv::PadN(0));
        round_trip(Tlv::PadN(255));
        round_trip(Tlv::short_hello(NodeId::from_u64(u64::MAX)));
        round_trip(Tlv::long_hello(NodeId::from_u64(1), NodeId::from_u64(2)));
        round_trip(Tlv::Neighbour(addr));
        round_trip(Tlv::Ack(key(0xdead_beef, u32::MAX)));
        round_trip(Tlv::Warning(Vec::new()));
        round_trip(Tlv::Warning(vec![b'w'; MAX_TLV_BODY]));

        for len in [0, 1, MAX_DATA_PAYLOAD - 1, MAX_DATA_PAYLOAD] {
            round_trip(Tlv::Data {
                key: key(7, 42),
                payload_type: PAYLOAD_TYPE_TEXT,
                payload: vec![0xAB; len],
            });
        }
        for len in [0, 1, MAX_GO_AWAY_MESSAGE] {
            round_trip(Tlv::GoAway { code: GoAwayCode::Inactive, message: vec![b'x'; len] });
        }
    }

    #[test]
    fn header_layout_is_network_order() {
        let mut message = Message::new();
        message.push(Tlv::short_hello(NodeId::from_u64(0x0102_0304_0506_0708))).unwrap();
        message.push(Tlv::Pad1).unwrap();

        let bytes = message.encode();
        assert_eq!(
            bytes,
            vec![MAGIC, VERSION, 0, 11, 2, 8, 1, 2, 3, 4, 5, 6, 7, 8, 0]
        );
    }

    #[test]
    fn data_layout() {
        let tlv = Tlv::Data { key: key(1, 0x0A0B_0C0D), payload_type: 0, payload: b"hi".to_vec() };
        let bytes = Message::single(tlv).unwrap().encode();
        assert_eq!(&bytes[4..6], &[4, 15]);
        assert_eq!(&bytes[6..14], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[14..18], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(bytes[18], 0);
        assert_eq!(&bytes[19..], b"hi");
    }

    #[test]
    fn body_length_tracks_tlvs() {
        let mut message = Message::new();
        assert_eq!(message.body_length(), 0);
        message.push(Tlv::Pad1).unwrap();
        message.push(Tlv::PadN(3)).unwrap();
        message.push(Tlv::Ack(key(1, 1))).unwrap();
        assert_eq!(message.body_length() as usize, 1 + 5 + 14);
        assert_eq!(message.encode().len(), HEADER_SIZE + 20);
    }

    #[test]
    fn oversized_data_is_rejected() {
        let tlv = Tlv::Data { key: key(1, 1), payload_type: 0, payload: vec![0; MAX_DATA_PAYLOAD + 1] };
        assert_eq!(
            Message::single(tlv),
            Err(EncodeError::BodyTooLong { tlv_type: TlvType::Data, len: MAX_TLV_BODY + 1 })
        );
    }

    #[test]
    fn go_away_and_warning_constructors_truncate() {
        let long = "z".repeat(400);
        assert_eq!(Tlv::go_away(GoAwayCode::Leaving, &long).body_len(), MAX_TLV_BODY);
        assert_eq!(Tlv::warning(&long).body_len(), MAX_TLV_BODY);
    }

    #[test]
    fn multiple_tlvs_keep_order() {
        let mut message = Message::new();
        message.push(Tlv::long_hello(NodeId::from_u64(1), NodeId::from_u64(2))).unwrap();
        message.push(Tlv::Neighbour(NeighbourAddr::new("::1".parse().unwrap(), 1))).unwrap();
        message.push(Tlv::Neighbour(NeighbourAddr::new("::2".parse().unwrap(), 2))).unwrap();

        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert_eq!(Message::decode(&[MAGIC, VERSION, 0]), Err(DecodeError::TooShort { len: 3 }));
        assert_eq!(Message::decode(&[]), Err(DecodeError::TooShort { len: 0 }));
    }

    #[test]
    fn header_mismatches_are_rejected() {
        assert_eq!(Message::decode(&[1, VERSION, 0, 0]), Err(DecodeError::BadMagic(1)));
        assert_eq!(Message::decode(&[MAGIC, 9, 0, 0]), Err(DecodeError::BadVersion(9)));
        assert_eq!(
            Message::decode(&[MAGIC, VERSION, 0, 2, 0]),
            Err(DecodeError::LengthMismatch { declared: 2, actual: 1 })
        );
        assert!(Message::decode(&[MAGIC, VERSION, 0, 0]).unwrap().is_empty());
    }

    #[test]
    fn unknown_tlv_discards_whole_message() {
        let bytes = [MAGIC, VERSION, 0, 3, 0, 42, 0];
        assert_eq!(Message::decode(&bytes), Err(DecodeError::UnknownTlv(42)));
    }

    #[test]
    fn truncated_tlv_is_rejected() {
        // ACK claims 12 bytes but only 2 follow.
        let bytes = [MAGIC, VERSION, 0, 4, 5, 12, 0, 0];
        assert_eq!(Message::decode(&bytes), Err(DecodeError::Truncated { tlv_type: TlvType::Ack }));

        // Length byte itself missing.
        let bytes = [MAGIC, VERSION, 0, 1, 7];
        assert_eq!(Message::decode(&bytes), Err(DecodeError::Truncated { tlv_type: TlvType::Warning }));
    }

    #[test]
    fn impossible_tlv_lengths_are_rejected() {
        let hello = [MAGIC, VERSION, 0, 6, 2, 4, 0, 0, 0, 0];
        assert_eq!(
            Message::decode(&hello),
            Err(DecodeError::BadTlvLength { tlv_type: TlvType::Hello, len: 4 })
        );

        let go_away = [MAGIC, VERSION, 0, 2, 6, 0];
        assert_eq!(
            Message::decode(&go_away),
            Err(DecodeError::BadTlvLength { tlv_type: TlvType::GoAway, len: 0 })
        );

        let data = [MAGIC, VERSION, 0, 4, 4, 2, 0, 0];
        assert_eq!(
            Message::decode(&data),
            Err(DecodeError::BadTlvLength { tlv_type: TlvType::Data, len: 2 })
        );
    }

    #[test]
    fn go_away_codes_round_trip() {
        for code in 0..=255u8 {
            assert_eq!(GoAwayCode::from_u8(code).as_u8(), code);
        }
        assert_eq!(GoAwayCode::from_u8(3), GoAwayCode::ProtocolViolation);
    }

    #[test]
    fn fits_respects_datagram_budget() {
        let mut message = Message::new();
        let neighbour = Tlv::Neighbour(NeighbourAddr::new("::1".parse().unwrap(), 1));
        while message.fits(&neighbour, MAX_DATAGRAM_SIZE) {
            message.push(neighbour.clone()).unwrap();
        }
        assert!(message.encoded_len() <= MAX_DATAGRAM_SIZE);
        assert!(message.encoded_len() + neighbour.wire_len() > MAX_DATAGRAM_SIZE);
    }
}
