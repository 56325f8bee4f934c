use catline_proto::call::MediaKind;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ringing,
    Accepted,
    Connected,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Connected => "connected",
        }
    }
}

#[derive(Debug)]
pub enum RegistryError {
    DuplicateCallId,
    IdenticalParties,
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateCallId => write!(f, "call id already registered"),
            Self::IdenticalParties => write!(f, "call parties must differ"),
        }
    }
}

impl Error for RegistryError {}

/// One tracked call. Terminal states have no representation here; a call
/// that ends is removed from the registry.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    pub chat_id: String,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn involves(&self, user_id: &str) -> bool {
        self.caller == user_id || self.callee == user_id
    }

    pub fn other_party(&self, user_id: &str) -> Option<&str> {
        if self.caller == user_id {
            Some(self.callee.as_str())
        } else if self.callee == user_id {
            Some(self.caller.as_str())
        } else {
            None
        }
    }
}

/// Owns all live call records; exactly one record per call id.
#[derive(Default)]
pub struct CallRegistry {
    calls: HashMap<String, CallRecord>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: CallRecord) -> Result<(), RegistryError> {
        if record.caller == record.callee {
            return Err(RegistryError::IdenticalParties);
        }
        if self.calls.contains_key(&record.call_id) {
            return Err(RegistryError::DuplicateCallId);
        }
        self.calls.insert(record.call_id.clone(), record);
        Ok(())
    }

    pub fn get(&self, call_id: &str) -> Option<&CallRecord> {
        self.calls.get(call_id)
    }

    pub fn status(&self, call_id: &str) -> Option<CallStatus> {
        self.calls.get(call_id).map(|record| record.status)
    }

    pub fn set_status(&mut self, call_id: &str, status: CallStatus) -> bool {
        match self.calls.get_mut(call_id) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, call_id: &str) -> Option<CallRecord> {
        self.calls.remove(call_id)
    }

    /// O(active calls) scan; call concurrency is inherently small.
    pub fn calls_involving(&self, user_id: &str) -> Vec<String> {
        self.calls
            .values()
            .filter(|record| record.involves(user_id))
            .map(|record| record.call_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn snapshot(&self) -> Value {
        let calls: Vec<Value> = self
            .calls
            .values()
            .map(|record| {
                json!({
                    "call_id": record.call_id,
                    "caller": record.caller,
                    "callee": record.callee,
                    "chat_id": record.chat_id,
                    "media_kind": record.media_kind.as_str(),
                    "status": record.status.as_str(),
                    "started_at": record.started_at.to_rfc3339(),
                })
            })
            .collect();
        Value::Array(calls)
    }
}
