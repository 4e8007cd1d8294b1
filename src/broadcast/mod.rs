pub mod bus;
pub mod hub;
pub mod session;

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::crawler::progress::ProgressEvent;
use crate::queue::JobQueue;

pub use bus::{EventBus, NullBus, RedisBus};
pub use hub::{BroadcastHub, HubSettings};
pub use session::{ConnectionId, ServerMessage, SubscriberSession};

/// Resolves an externally issued token to a user id. Issuing tokens is
/// someone else's job.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<String>;
}

/// Fixed token table, for embedding and tests.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn single(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        let mut tokens = HashMap::new();
        tokens.insert(token.into(), user_id.into());
        Self { tokens }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

/// Answers whether a user may watch a job. Checked at subscribe time.
#[async_trait]
pub trait OwnershipCheck: Send + Sync {
    async fn user_owns_job(&self, user_id: &str, job_id: Uuid) -> bool;
}

/// Fallback source for progress snapshots when the hub's cache misses.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn latest_progress(&self, job_id: Uuid) -> Option<ProgressEvent>;
}

#[async_trait]
impl OwnershipCheck for JobQueue {
    async fn user_owns_job(&self, user_id: &str, job_id: Uuid) -> bool {
        match self.job(job_id).await {
            Ok(record) => record.user_id == user_id,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl SnapshotSource for JobQueue {
    async fn latest_progress(&self, job_id: Uuid) -> Option<ProgressEvent> {
        let record = self.job(job_id).await.ok()?;
        let progress = record.progress?;
        Some(ProgressEvent::new(record.id, record.user_id, progress))
    }
}
