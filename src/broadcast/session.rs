use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crawler::progress::ProgressEvent;

/// Opaque handle for one subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Messages pushed to a connection. The presentation layer owns the wire
/// encoding; these are its payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk { user_id: String, session_id: Uuid },
    AuthError { message: String },
    Snapshot { event: ProgressEvent },
    Progress { event: ProgressEvent },
    Error { message: String },
    Disconnected { reason: String },
}

/// State attached to a connection once it authenticates.
#[derive(Debug, Clone)]
pub struct SubscriberSession {
    pub connection_id: ConnectionId,
    pub session_id: Uuid,
    pub user_id: String,
    pub addr: IpAddr,
    pub subscriptions: HashSet<Uuid>,
    pub last_activity: Instant,
}

impl SubscriberSession {
    pub fn new(connection_id: ConnectionId, user_id: impl Into<String>, addr: IpAddr) -> Self {
        Self {
            connection_id,
            session_id: Uuid::new_v4(),
            user_id: user_id.into(),
            addr,
            subscriptions: HashSet::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
