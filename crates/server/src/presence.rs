use catline_proto::call::ServerEvent;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Coarse availability of a user for call routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Idle,
    Calling,
    InCall,
}

impl Availability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::InCall => "in_call",
        }
    }
}

/// Outbound handle for one live connection. The session id distinguishes a
/// replaced connection from the one that replaced it.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub session_id: String,
    pub sender: mpsc::Sender<ServerEvent>,
}

pub struct PresenceEntry {
    pub connection: Option<ConnectionHandle>,
    pub availability: Availability,
}

/// Maps user ids to live connection handles and availability. Pure map
/// mutations; callers serialize access through the owning core lock.
#[derive(Default)]
pub struct PresenceDirectory {
    entries: HashMap<String, PresenceEntry>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a connection handle for the user, last connection wins.
    /// Availability resets to idle; the caller is responsible for tearing
    /// down any call the previous connection was part of.
    pub fn register(&mut self, user_id: &str, handle: ConnectionHandle) {
        self.entries.insert(
            user_id.to_string(),
            PresenceEntry {
                connection: Some(handle),
                availability: Availability::Idle,
            },
        );
    }

    /// Drops the entry if it still belongs to the given session. Returns
    /// false when a newer connection has already replaced it.
    pub fn unregister(&mut self, user_id: &str, session_id: &str) -> bool {
        let owned = self
            .entries
            .get(user_id)
            .and_then(|entry| entry.connection.as_ref())
            .map(|conn| conn.session_id == session_id)
            .unwrap_or(false);
        if owned {
            self.entries.remove(user_id);
        }
        owned
    }

    /// Drops the entry unconditionally (delivery failure path).
    pub fn evict(&mut self, user_id: &str) {
        self.entries.remove(user_id);
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    pub fn availability(&self, user_id: &str) -> Availability {
        self.entries
            .get(user_id)
            .map(|entry| entry.availability)
            .unwrap_or(Availability::Idle)
    }

    pub fn set_availability(&mut self, user_id: &str, availability: Availability) {
        if let Some(entry) = self.entries.get_mut(user_id) {
            entry.availability = availability;
        }
    }

    pub fn live_sender(&self, user_id: &str) -> Option<mpsc::Sender<ServerEvent>> {
        self.entries
            .get(user_id)
            .and_then(|entry| entry.connection.as_ref())
            .map(|conn| conn.sender.clone())
    }

    pub fn session_id(&self, user_id: &str) -> Option<&str> {
        self.entries
            .get(user_id)
            .and_then(|entry| entry.connection.as_ref())
            .map(|conn| conn.session_id.as_str())
    }

    pub fn snapshot(&self) -> Value {
        let users: Vec<Value> = self
            .entries
            .iter()
            .map(|(user_id, entry)| {
                json!({
                    "user_id": user_id,
                    "availability": entry.availability.as_str(),
                    "connected": entry.connection.is_some(),
                })
            })
            .collect();
        Value::Array(users)
    }
}
