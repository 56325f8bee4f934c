use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod call;

pub const PROTOCOL_VERSION: u16 = 1;
pub const MAX_FRAME_LEN: usize = 1024 * 1024;
pub const MAX_CONTROL_JSON_LEN: usize = 256 * 1024;
pub const MAX_SEQUENCE: u64 = u32::MAX as u64;

/// Signaling event discriminator carried as the first byte of a frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    Hello = 0x01,
    Initiate = 0x02,
    Accept = 0x03,
    Reject = 0x04,
    End = 0x05,
    Offer = 0x06,
    Answer = 0x07,
    Candidate = 0x08,
    IncomingCall = 0x09,
    CallAccepted = 0x0a,
    CallRejected = 0x0b,
    CallEnded = 0x0c,
    CallTimeout = 0x0d,
    CallFailed = 0x0e,
    Snapshot = 0x0f,
    SnapshotState = 0x10,
    Error = 0x11,
}

impl EventType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Initiate),
            0x03 => Some(Self::Accept),
            0x04 => Some(Self::Reject),
            0x05 => Some(Self::End),
            0x06 => Some(Self::Offer),
            0x07 => Some(Self::Answer),
            0x08 => Some(Self::Candidate),
            0x09 => Some(Self::IncomingCall),
            0x0a => Some(Self::CallAccepted),
            0x0b => Some(Self::CallRejected),
            0x0c => Some(Self::CallEnded),
            0x0d => Some(Self::CallTimeout),
            0x0e => Some(Self::CallFailed),
            0x0f => Some(Self::Snapshot),
            0x10 => Some(Self::SnapshotState),
            0x11 => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    InvalidEventType,
    InvalidControlJson,
    UnexpectedEof,
    VarintOverflow,
    FrameTooLarge,
    ControlTooLarge,
    SequenceTooLarge,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidEventType => write!(f, "invalid event type"),
            Self::InvalidControlJson => write!(f, "invalid control payload"),
            Self::UnexpectedEof => write!(f, "unexpected end of frame"),
            Self::VarintOverflow => write!(f, "varint overflow"),
            Self::FrameTooLarge => write!(f, "frame exceeds limits"),
            Self::ControlTooLarge => write!(f, "control payload exceeds limits"),
            Self::SequenceTooLarge => write!(f, "sequence exceeds limits"),
        }
    }
}

impl Error for CodecError {}

/// Untyped JSON properties of a signaling event. Negotiation payloads ride
/// inside as opaque values; the codec never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlEnvelope {
    pub properties: serde_json::Value,
}

impl ControlEnvelope {
    pub fn empty() -> Self {
        ControlEnvelope {
            properties: serde_json::Value::Null,
        }
    }
}

/// A single signaling event on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    pub sequence: u64,
    pub event_type: EventType,
    pub envelope: ControlEnvelope,
}

impl EventFrame {
    /// Serializes the frame into a length prefixed binary representation.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.sequence > MAX_SEQUENCE {
            return Err(CodecError::SequenceTooLarge);
        }
        let payload =
            serde_json::to_vec(&self.envelope).map_err(|_| CodecError::InvalidControlJson)?;
        if payload.len() > MAX_CONTROL_JSON_LEN {
            return Err(CodecError::ControlTooLarge);
        }
        let mut body = Vec::with_capacity(payload.len() + 12);
        body.push(self.event_type as u8);
        encode_varint(self.sequence, &mut body);
        encode_varint(payload.len() as u64, &mut body);
        body.extend_from_slice(&payload);
        if body.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        let mut encoded = Vec::with_capacity(body.len() + 4);
        encode_varint(body.len() as u64, &mut encoded);
        encoded.extend_from_slice(&body);
        Ok(encoded)
    }

    /// Attempts to decode one frame from a contiguous buffer. Returns the
    /// frame and the number of bytes consumed; `UnexpectedEof` means the
    /// buffer does not yet hold a complete frame.
    pub fn decode(buffer: &[u8]) -> Result<(Self, usize), CodecError> {
        let (body_len_raw, header_len) = decode_varint(buffer)?;
        let body_len = usize::try_from(body_len_raw).map_err(|_| CodecError::FrameTooLarge)?;
        if body_len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        // a declared empty body can never complete; treat it as malformed
        // rather than waiting for bytes that will not come
        if body_len == 0 {
            return Err(CodecError::InvalidEventType);
        }
        if buffer.len() < header_len + body_len {
            return Err(CodecError::UnexpectedEof);
        }
        let body = &buffer[header_len..header_len + body_len];
        let event_type = EventType::from_u8(body[0]).ok_or(CodecError::InvalidEventType)?;
        let mut cursor = 1;
        let (sequence, read) = decode_varint(&body[cursor..])?;
        cursor += read;
        if sequence > MAX_SEQUENCE {
            return Err(CodecError::SequenceTooLarge);
        }
        let (payload_len_raw, read) = decode_varint(&body[cursor..])?;
        cursor += read;
        let payload_len =
            usize::try_from(payload_len_raw).map_err(|_| CodecError::ControlTooLarge)?;
        if payload_len > MAX_CONTROL_JSON_LEN {
            return Err(CodecError::ControlTooLarge);
        }
        if body.len() < cursor + payload_len {
            return Err(CodecError::UnexpectedEof);
        }
        let envelope =
            serde_json::from_slice::<ControlEnvelope>(&body[cursor..cursor + payload_len])
                .map_err(|_| CodecError::InvalidControlJson)?;
        Ok((
            EventFrame {
                sequence,
                event_type,
                envelope,
            },
            header_len + body_len,
        ))
    }
}

fn encode_varint(mut value: u64, buffer: &mut Vec<u8>) {
    while value >= 0x80 {
        buffer.push(((value as u8) & 0x7f) | 0x80);
        value >>= 7;
    }
    buffer.push(value as u8);
}

fn decode_varint(buffer: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (index, byte) in buffer.iter().enumerate() {
        let part = (byte & 0x7f) as u64;
        value |= part << shift;
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
        shift += 7;
        if shift > 63 {
            return Err(CodecError::VarintOverflow);
        }
    }
    Err(CodecError::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrip_event_frame() {
        let frame = EventFrame {
            sequence: 42,
            event_type: EventType::Hello,
            envelope: ControlEnvelope {
                properties: serde_json::json!({
                    "user_id": "alice",
                    "protocol_version": PROTOCOL_VERSION,
                }),
            },
        };
        let encoded = frame.encode().unwrap();
        let (decoded, read) = EventFrame::decode(&encoded).unwrap();
        assert_eq!(read, encoded.len());
        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.event_type, EventType::Hello);
        assert_eq!(
            decoded
                .envelope
                .properties
                .get("user_id")
                .and_then(|v| v.as_str()),
            Some("alice")
        );
    }

    #[test]
    fn decode_multiple_frames_in_sequence() {
        let first = EventFrame {
            sequence: 1,
            event_type: EventType::Initiate,
            envelope: ControlEnvelope {
                properties: serde_json::json!({"target_user_id": "bob"}),
            },
        };
        let second = EventFrame {
            sequence: 2,
            event_type: EventType::Candidate,
            envelope: ControlEnvelope {
                properties: serde_json::json!({"call_id": "c", "payload": {"candidate": "udp"}}),
            },
        };
        let mut concatenated = first.encode().unwrap();
        let first_len = concatenated.len();
        concatenated.extend_from_slice(&second.encode().unwrap());
        let (decoded1, read1) = EventFrame::decode(&concatenated).unwrap();
        assert_eq!(read1, first_len);
        assert_eq!(decoded1.event_type, EventType::Initiate);
        let (decoded2, read2) = EventFrame::decode(&concatenated[read1..]).unwrap();
        assert_eq!(read1 + read2, concatenated.len());
        assert_eq!(decoded2.sequence, 2);
    }

    #[test]
    fn decode_partial_buffer_reports_eof() {
        let frame = EventFrame {
            sequence: 7,
            event_type: EventType::Accept,
            envelope: ControlEnvelope {
                properties: serde_json::json!({"call_id": "call-1"}),
            },
        };
        let encoded = frame.encode().unwrap();
        for cut in 0..encoded.len() {
            assert!(matches!(
                EventFrame::decode(&encoded[..cut]),
                Err(CodecError::UnexpectedEof)
            ));
        }
    }

    #[test]
    fn decode_rejects_unknown_event_type() {
        let frame = EventFrame {
            sequence: 3,
            event_type: EventType::End,
            envelope: ControlEnvelope {
                properties: serde_json::json!({"call_id": "x"}),
            },
        };
        let mut encoded = frame.encode().unwrap();
        let (_, header_len) = decode_varint(&encoded).unwrap();
        encoded[header_len] = 0xfe;
        assert!(matches!(
            EventFrame::decode(&encoded),
            Err(CodecError::InvalidEventType)
        ));
    }

    #[test]
    fn decode_rejects_empty_body() {
        // varint 0 body length: malformed, not a partial frame
        let buffer = [0x00u8];
        assert!(matches!(
            EventFrame::decode(&buffer),
            Err(CodecError::InvalidEventType)
        ));
    }

    #[test]
    fn decode_rejects_varint_overflow() {
        let buffer = vec![0xff; 12];
        assert!(matches!(
            EventFrame::decode(&buffer),
            Err(CodecError::VarintOverflow)
        ));
    }

    #[test]
    fn decode_rejects_oversized_frame() {
        let mut buffer = Vec::new();
        encode_varint((MAX_FRAME_LEN + 1) as u64, &mut buffer);
        assert!(matches!(
            EventFrame::decode(&buffer),
            Err(CodecError::FrameTooLarge)
        ));
    }

    #[test]
    fn encode_rejects_oversized_control() {
        let blob = "x".repeat(MAX_CONTROL_JSON_LEN + 1);
        let frame = EventFrame {
            sequence: 1,
            event_type: EventType::Offer,
            envelope: ControlEnvelope {
                properties: serde_json::json!({"payload": blob}),
            },
        };
        assert!(matches!(frame.encode(), Err(CodecError::ControlTooLarge)));
    }
}
