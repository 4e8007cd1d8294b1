use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cli::config::CrawlConfiguration;
use crate::crawler::progress::CrawlProgress;
use crate::crawler::summary::CrawlResult;

/// Cooperative cancellation token shared between the queue and a running
/// crawl. Running code polls it at loop boundaries; nothing is preempted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Queue-level lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    /// Waiting out a retry backoff.
    Delayed,
    Paused,
    /// Cancelled while active; the crawl wound down cooperatively and its
    /// partial result is retained.
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            JobState::Paused => "paused",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Persisted view of one crawl job, from admission to reclamation.
/// Fully serializable so it can be mirrored to redis for cross-process
/// status lookups; runtime-only state (the cancel flag) lives in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub user_id: String,
    pub state: JobState,
    pub config: CrawlConfiguration,
    pub progress: Option<CrawlProgress>,
    pub result: Option<CrawlResult>,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

impl JobRecord {
    pub fn new(user_id: impl Into<String>, config: CrawlConfiguration) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            state: JobState::Waiting,
            config,
            progress: None,
            result: None,
            attempts_made: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn new_jobs_start_waiting() {
        let job = JobRecord::new("user-1", CrawlConfiguration::default());
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert!(job.started_at.is_none());
    }
}
