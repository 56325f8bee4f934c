use crate::{CodecError, ControlEnvelope, EventFrame, EventType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::TryFrom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Voice,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallFailureReason {
    UserBusy,
    UserOffline,
    InvalidCall,
    ServerError,
}

impl CallFailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserBusy => "user_busy",
            Self::UserOffline => "user_offline",
            Self::InvalidCall => "invalid_call",
            Self::ServerError => "server_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    Hangup,
    PeerDisconnected,
}

/// First frame on every connection; binds the transport to a user identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInitiate {
    pub target_user_id: String,
    pub chat_id: String,
    pub media_kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAccept {
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallReject {
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHangup {
    pub call_id: String,
}

/// Offer, answer or ICE candidate. The payload is owned by the negotiation
/// engines on each end and forwarded verbatim; `from_user_id` is stamped by
/// the relay on the way through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationSignal {
    pub call_id: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCall {
    pub call_id: String,
    pub caller_id: String,
    pub chat_id: String,
    pub media_kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAccepted {
    pub call_id: String,
    pub accepted_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRejected {
    pub call_id: String,
    pub rejected_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEnded {
    pub call_id: String,
    pub ended_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CallEndReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTimeout {
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFailed {
    pub reason: CallFailureReason,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

/// Debug introspection reply; not part of the protocol contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub calls: Value,
    pub presence: Value,
    pub metrics: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}

fn encode_control<T: Serialize>(value: T) -> Result<ControlEnvelope, CodecError> {
    serde_json::to_value(value)
        .map(|properties| ControlEnvelope { properties })
        .map_err(|_| CodecError::InvalidControlJson)
}

fn decode_control<T: DeserializeOwned>(envelope: &ControlEnvelope) -> Result<T, CodecError> {
    serde_json::from_value(envelope.properties.clone()).map_err(|_| CodecError::InvalidControlJson)
}

macro_rules! impl_control_codec {
    ($ty:ty) => {
        impl TryFrom<$ty> for ControlEnvelope {
            type Error = CodecError;

            fn try_from(value: $ty) -> Result<Self, Self::Error> {
                encode_control(value)
            }
        }

        impl TryFrom<&$ty> for ControlEnvelope {
            type Error = CodecError;

            fn try_from(value: &$ty) -> Result<Self, Self::Error> {
                encode_control(value)
            }
        }

        impl TryFrom<&ControlEnvelope> for $ty {
            type Error = CodecError;

            fn try_from(envelope: &ControlEnvelope) -> Result<Self, Self::Error> {
                decode_control::<$ty>(envelope)
            }
        }
    };
}

impl_control_codec!(Hello);
impl_control_codec!(CallInitiate);
impl_control_codec!(CallAccept);
impl_control_codec!(CallReject);
impl_control_codec!(CallHangup);
impl_control_codec!(NegotiationSignal);
impl_control_codec!(IncomingCall);
impl_control_codec!(CallAccepted);
impl_control_codec!(CallRejected);
impl_control_codec!(CallEnded);
impl_control_codec!(CallTimeout);
impl_control_codec!(CallFailed);
impl_control_codec!(SnapshotState);
impl_control_codec!(ErrorEvent);

/// Events travelling client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Hello(Hello),
    Initiate(CallInitiate),
    Accept(CallAccept),
    Reject(CallReject),
    End(CallHangup),
    Offer(NegotiationSignal),
    Answer(NegotiationSignal),
    Candidate(NegotiationSignal),
    Snapshot,
}

impl ClientEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Hello(_) => EventType::Hello,
            Self::Initiate(_) => EventType::Initiate,
            Self::Accept(_) => EventType::Accept,
            Self::Reject(_) => EventType::Reject,
            Self::End(_) => EventType::End,
            Self::Offer(_) => EventType::Offer,
            Self::Answer(_) => EventType::Answer,
            Self::Candidate(_) => EventType::Candidate,
            Self::Snapshot => EventType::Snapshot,
        }
    }

    pub fn into_frame(self, sequence: u64) -> Result<EventFrame, CodecError> {
        let event_type = self.event_type();
        let envelope = match self {
            Self::Hello(v) => ControlEnvelope::try_from(v)?,
            Self::Initiate(v) => ControlEnvelope::try_from(v)?,
            Self::Accept(v) => ControlEnvelope::try_from(v)?,
            Self::Reject(v) => ControlEnvelope::try_from(v)?,
            Self::End(v) => ControlEnvelope::try_from(v)?,
            Self::Offer(v) | Self::Answer(v) | Self::Candidate(v) => {
                ControlEnvelope::try_from(v)?
            }
            Self::Snapshot => ControlEnvelope::empty(),
        };
        Ok(EventFrame {
            sequence,
            event_type,
            envelope,
        })
    }
}

impl TryFrom<&EventFrame> for ClientEvent {
    type Error = CodecError;

    fn try_from(frame: &EventFrame) -> Result<Self, Self::Error> {
        match frame.event_type {
            EventType::Hello => Ok(Self::Hello(Hello::try_from(&frame.envelope)?)),
            EventType::Initiate => Ok(Self::Initiate(CallInitiate::try_from(&frame.envelope)?)),
            EventType::Accept => Ok(Self::Accept(CallAccept::try_from(&frame.envelope)?)),
            EventType::Reject => Ok(Self::Reject(CallReject::try_from(&frame.envelope)?)),
            EventType::End => Ok(Self::End(CallHangup::try_from(&frame.envelope)?)),
            EventType::Offer => Ok(Self::Offer(NegotiationSignal::try_from(&frame.envelope)?)),
            EventType::Answer => Ok(Self::Answer(NegotiationSignal::try_from(&frame.envelope)?)),
            EventType::Candidate => Ok(Self::Candidate(NegotiationSignal::try_from(
                &frame.envelope,
            )?)),
            EventType::Snapshot => Ok(Self::Snapshot),
            _ => Err(CodecError::InvalidEventType),
        }
    }
}

/// Events travelling server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    IncomingCall(IncomingCall),
    CallAccepted(CallAccepted),
    CallRejected(CallRejected),
    CallEnded(CallEnded),
    CallTimeout(CallTimeout),
    CallFailed(CallFailed),
    Offer(NegotiationSignal),
    Answer(NegotiationSignal),
    Candidate(NegotiationSignal),
    SnapshotState(SnapshotState),
    Error(ErrorEvent),
}

impl ServerEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::IncomingCall(_) => EventType::IncomingCall,
            Self::CallAccepted(_) => EventType::CallAccepted,
            Self::CallRejected(_) => EventType::CallRejected,
            Self::CallEnded(_) => EventType::CallEnded,
            Self::CallTimeout(_) => EventType::CallTimeout,
            Self::CallFailed(_) => EventType::CallFailed,
            Self::Offer(_) => EventType::Offer,
            Self::Answer(_) => EventType::Answer,
            Self::Candidate(_) => EventType::Candidate,
            Self::SnapshotState(_) => EventType::SnapshotState,
            Self::Error(_) => EventType::Error,
        }
    }

    pub fn into_frame(self, sequence: u64) -> Result<EventFrame, CodecError> {
        let event_type = self.event_type();
        let envelope = match self {
            Self::IncomingCall(v) => ControlEnvelope::try_from(v)?,
            Self::CallAccepted(v) => ControlEnvelope::try_from(v)?,
            Self::CallRejected(v) => ControlEnvelope::try_from(v)?,
            Self::CallEnded(v) => ControlEnvelope::try_from(v)?,
            Self::CallTimeout(v) => ControlEnvelope::try_from(v)?,
            Self::CallFailed(v) => ControlEnvelope::try_from(v)?,
            Self::Offer(v) | Self::Answer(v) | Self::Candidate(v) => {
                ControlEnvelope::try_from(v)?
            }
            Self::SnapshotState(v) => ControlEnvelope::try_from(v)?,
            Self::Error(v) => ControlEnvelope::try_from(v)?,
        };
        Ok(EventFrame {
            sequence,
            event_type,
            envelope,
        })
    }
}

impl TryFrom<&EventFrame> for ServerEvent {
    type Error = CodecError;

    fn try_from(frame: &EventFrame) -> Result<Self, CodecError> {
        match frame.event_type {
            EventType::IncomingCall => {
                Ok(Self::IncomingCall(IncomingCall::try_from(&frame.envelope)?))
            }
            EventType::CallAccepted => {
                Ok(Self::CallAccepted(CallAccepted::try_from(&frame.envelope)?))
            }
            EventType::CallRejected => {
                Ok(Self::CallRejected(CallRejected::try_from(&frame.envelope)?))
            }
            EventType::CallEnded => Ok(Self::CallEnded(CallEnded::try_from(&frame.envelope)?)),
            EventType::CallTimeout => {
                Ok(Self::CallTimeout(CallTimeout::try_from(&frame.envelope)?))
            }
            EventType::CallFailed => Ok(Self::CallFailed(CallFailed::try_from(&frame.envelope)?)),
            EventType::Offer => Ok(Self::Offer(NegotiationSignal::try_from(&frame.envelope)?)),
            EventType::Answer => Ok(Self::Answer(NegotiationSignal::try_from(&frame.envelope)?)),
            EventType::Candidate => Ok(Self::Candidate(NegotiationSignal::try_from(
                &frame.envelope,
            )?)),
            EventType::SnapshotState => Ok(Self::SnapshotState(SnapshotState::try_from(
                &frame.envelope,
            )?)),
            EventType::Error => Ok(Self::Error(ErrorEvent::try_from(&frame.envelope)?)),
            _ => Err(CodecError::InvalidEventType),
        }
    }
}
